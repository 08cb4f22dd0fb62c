/// Engine configuration.

/// Default chunk size: 16 MiB per pull.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 24;

/// Default ceiling on concurrently outstanding pulls per session.
pub const DEFAULT_MAX_WINDOW_DEPTH: usize = 4;

/// What to do with a request whose remote region is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyTransferPolicy {
    /// Respond immediately with zero bytes; no pull is issued.
    #[default]
    Complete,
    /// Refuse the request with `EngineError::EmptyTransfer`.
    Reject,
}

impl std::str::FromStr for EmptyTransferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown empty transfer policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size used when the caller passes zero.
    /// Default: 16 MiB
    pub default_chunk_size: u64,
    /// Upper bound on the window depth a caller may request.
    /// Default: 4
    pub max_window_depth: usize,
    /// Handling of zero-length transfers.
    /// Default: Complete
    pub empty_transfer: EmptyTransferPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_window_depth: DEFAULT_MAX_WINDOW_DEPTH,
            empty_transfer: EmptyTransferPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_chunk_size(mut self, chunk_size: u64) -> Self {
        self.default_chunk_size = chunk_size;
        self
    }

    pub fn with_max_window_depth(mut self, depth: usize) -> Self {
        self.max_window_depth = depth;
        self
    }

    pub fn with_empty_transfer(mut self, policy: EmptyTransferPolicy) -> Self {
        self.empty_transfer = policy;
        self
    }

    /// Read overrides from `HAVEN_BULK_*` environment variables. Unset or
    /// unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let default_chunk_size = lookup("HAVEN_BULK_CHUNK_SIZE")
            .and_then(|v| v.parse().ok())
            .filter(|&v: &u64| v > 0)
            .unwrap_or(defaults.default_chunk_size);
        let max_window_depth = lookup("HAVEN_BULK_MAX_WINDOW")
            .and_then(|v| v.parse().ok())
            .filter(|&v: &usize| v > 0)
            .unwrap_or(defaults.max_window_depth);
        let empty_transfer = match lookup("HAVEN_BULK_EMPTY_TRANSFER").map(|v| v.parse()) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                tracing::warn!("{}, using {:?}", e, defaults.empty_transfer);
                defaults.empty_transfer
            }
            None => defaults.empty_transfer,
        };
        Self {
            default_chunk_size,
            max_window_depth,
            empty_transfer,
        }
    }
}
