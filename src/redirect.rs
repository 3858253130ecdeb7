/// Decides whether the transport follows a redirect response or hands it back as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }

    /// `history_len` is the number of redirects already followed for this call.
    pub const fn should_follow(self, history_len: usize) -> bool {
        self.enabled && history_len < self.max_redirects
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::none()
    }
}
