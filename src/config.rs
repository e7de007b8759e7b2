use std::{env, str::FromStr, time::Duration};

use crate::diag::{Error, Kind, Result};

/// Largest accepted buffer size.
pub const MAX_BUFFER_SIZE: u32 = 16 * 1024 * 1024;

/// Buffer sizes must be a multiple of this.
pub const BUFFER_ALIGNMENT: u32 = 8;

bitflags::bitflags! {
    /// Behavior switches passed to `Engine::initialize`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// The engine drains dirty buffers itself on a collector thread.
        /// `Engine::process_buffers` must not be used.
        const AUTOCOLLECT = 1;
        /// Thread data is only taken from the preallocation pool.
        const DISABLE_LAZY_ALLOCATION = 2;
        /// Do not wake the collector when a buffer turns dirty; it only
        /// drains on its polling interval.
        const DISABLE_EAGER_BUFFER_COLLECTION = 4;
    }
}

/// Sizing and behavior of a tracing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Total number of buffers. Should be at least twice the number of
    /// traced threads.
    pub buffer_count: u32,
    /// Size of each buffer in bytes.
    pub buffer_size: u32,
    /// Thread data records created up front.
    pub thread_data_preallocations: u32,
    pub flags: Flags,
    /// Polling period of the collector when eager wake-ups are disabled.
    pub collect_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_count: 64,
            buffer_size: 64 * 1024,
            thread_data_preallocations: 0,
            flags: Flags::empty(),
            collect_interval: Duration::from_millis(100),
        }
    }
}

fn invalid(detail: &str) -> Error {
    Error::new(Kind::InvalidArgument).with_detail(detail)
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(&format!("{name}={value}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(invalid(name)),
    }
}

impl Options {
    #[must_use]
    pub fn new(buffer_count: u32, buffer_size: u32, flags: Flags) -> Self {
        Self {
            buffer_count,
            buffer_size,
            flags,
            ..Self::default()
        }
    }

    /// Overlays `FBT_BUFFER_COUNT`, `FBT_BUFFER_SIZE`,
    /// `FBT_THREAD_PREALLOCATIONS` and `FBT_FLAGS` on the defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a variable is set but malformed, or if
    /// the resulting options do not validate.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(count) = parse_var("FBT_BUFFER_COUNT")? {
            options.buffer_count = count;
        }
        if let Some(size) = parse_var("FBT_BUFFER_SIZE")? {
            options.buffer_size = size;
        }
        if let Some(count) = parse_var("FBT_THREAD_PREALLOCATIONS")? {
            options.thread_data_preallocations = count;
        }
        if let Some(bits) = parse_var::<u32>("FBT_FLAGS")? {
            options.flags =
                Flags::from_bits(bits).ok_or_else(|| invalid("FBT_FLAGS"))?;
        }

        options.validate()?;
        Ok(options)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` on zero or oversized buffers, a buffer
    /// size that is not a multiple of `BUFFER_ALIGNMENT`, or disabled lazy
    /// allocation without preallocated thread data.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(invalid("buffer count must not be zero"));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(invalid("buffer size out of range"));
        }
        if self.buffer_size % BUFFER_ALIGNMENT != 0 {
            return Err(invalid("buffer size is not properly aligned"));
        }
        if self.flags.contains(Flags::DISABLE_LAZY_ALLOCATION)
            && self.thread_data_preallocations == 0
        {
            return Err(invalid("lazy allocation disabled without preallocations"));
        }
        if self.collect_interval.is_zero() {
            return Err(invalid("collect interval must not be zero"));
        }

        Ok(())
    }

    #[must_use]
    pub fn autocollect(&self) -> bool {
        self.flags.contains(Flags::AUTOCOLLECT)
    }
}
