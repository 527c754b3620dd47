//! Linear Memory Configuration
//!
//! This module provides configuration for linear-memory allocation.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `LINMEM_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LINMEM_MAX_MEM_PAGES` | Maximum linear-memory size in 64 KiB pages | 16384 (1 GiB) |
//! | `LINMEM_GUARD_REGIONS` | Request guard regions by default ("true"/"false") | true on 64-bit |
//! | `LINMEM_MAX_HEAP_OFFSET` | Largest reachable offset, used to size guard regions | 8 GiB - 1 |
//! | `LINMEM_ADDRESS_SPACE` | Address-space width override ("32"/"64") | native |
//! | `LINMEM_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use linmem_runtime::config::LinearMemoryConfig;
//!
//! // Load from environment with defaults
//! let config = LinearMemoryConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = LinearMemoryConfig::builder()
//!     .max_mem_pages(256)
//!     .guard_regions(false)
//!     .build()?;
//! ```

use std::env;
use std::str::FromStr;

use thiserror::Error;

/// Size of one linear-memory page in bytes (64 KiB).
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Default maximum number of linear-memory pages (1 GiB).
pub const DEFAULT_MAX_MEM_PAGES: u32 = 16 * 1024;

/// Largest offset an in-range access can reach: a 32-bit index plus a
/// 32-bit static offset, plus one.
pub const DEFAULT_MAX_HEAP_OFFSET: u64 = u32::MAX as u64 + u32::MAX as u64 + 1;

/// Largest byte length a host buffer object can describe.
pub const PLATFORM_MAX_BUFFER_LENGTH: usize = i32::MAX as usize;

/// Address-space cap on 64-bit targets (1 TiB).
const ADDRESS_SPACE_LIMIT_64: u64 = 1 << 40;

/// Address-space cap on 32-bit targets (2 GiB).
const ADDRESS_SPACE_LIMIT_32: u64 = 0x8000_0000;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::EnvParseError {
                var: "LINMEM_LOG_LEVEL".into(),
                message: format!("unknown log level '{}'", s),
            }),
        }
    }
}

/// Width of the process address space.
///
/// Selects the address-space cap and whether guard regions are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceWidth {
    /// 32-bit address space: 2 GiB cap, no guard regions.
    Bits32,
    /// 64-bit address space: 1 TiB cap, guard regions available.
    Bits64,
}

impl AddressSpaceWidth {
    /// The width of the target this crate was compiled for.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            AddressSpaceWidth::Bits64
        } else {
            AddressSpaceWidth::Bits32
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "32" => Some(AddressSpaceWidth::Bits32),
            "64" => Some(AddressSpaceWidth::Bits64),
            _ => None,
        }
    }
}

impl Default for AddressSpaceWidth {
    fn default() -> Self {
        Self::native()
    }
}

/// Memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum linear-memory size in pages.
    /// Default: 16384 (1 GiB).
    pub max_mem_pages: u32,

    /// Largest offset reachable by an in-range access, used to size guarded
    /// reservations.
    /// Default: 8 GiB - 1.
    pub max_heap_offset: u64,

    /// Whether guard regions are requested by default, as used by
    /// [`BufferLifecycle::create_default`](crate::BufferLifecycle::create_default).
    /// Default: true on 64-bit targets.
    pub guard_regions: bool,

    /// Address-space width used to pick the reservation cap.
    /// Default: native.
    pub address_space: AddressSpaceWidth,

    /// Largest byte length the host buffer object can describe.
    /// Default: `i32::MAX`.
    pub platform_max_buffer_length: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_mem_pages: DEFAULT_MAX_MEM_PAGES,
            max_heap_offset: DEFAULT_MAX_HEAP_OFFSET,
            guard_regions: AddressSpaceWidth::native() == AddressSpaceWidth::Bits64,
            address_space: AddressSpaceWidth::native(),
            platform_max_buffer_length: PLATFORM_MAX_BUFFER_LENGTH,
        }
    }
}

impl MemoryConfig {
    /// Largest logical buffer size a new buffer may have.
    ///
    /// `min(max_mem_pages * WASM_PAGE_SIZE, platform_max_buffer_length)`.
    pub fn max_buffer_length(&self) -> usize {
        (self.max_mem_pages as usize)
            .saturating_mul(WASM_PAGE_SIZE)
            .min(self.platform_max_buffer_length)
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include thread names in log output.
    /// Default: true.
    pub thread_names: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            thread_names: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete linear-memory configuration.
///
/// Use `LinearMemoryConfig::default()` for sensible defaults, or
/// `LinearMemoryConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct LinearMemoryConfig {
    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl LinearMemoryConfig {
    /// Create a new builder for LinearMemoryConfig.
    pub fn builder() -> LinearMemoryConfigBuilder {
        LinearMemoryConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set, or that hold invalid values,
    /// leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env::<u32>("LINMEM_MAX_MEM_PAGES") {
            if val > 0 {
                config.memory.max_mem_pages = val;
            }
        }

        if let Some(val) = parse_env::<u64>("LINMEM_MAX_HEAP_OFFSET") {
            if val >= WASM_PAGE_SIZE as u64 {
                config.memory.max_heap_offset = val;
            }
        }

        if let Some(val) = env::var("LINMEM_ADDRESS_SPACE")
            .ok()
            .and_then(|s| AddressSpaceWidth::parse(&s))
        {
            config.memory.address_space = val;
        }

        if let Some(val) = parse_env_bool("LINMEM_GUARD_REGIONS") {
            config.memory.guard_regions = val;
        }

        if let Ok(val) = env::var("LINMEM_LOG_LEVEL") {
            if let Ok(level) = val.parse() {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.max_mem_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_mem_pages".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.memory.max_heap_offset < WASM_PAGE_SIZE as u64 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_heap_offset".into(),
                message: format!("must be at least {} bytes", WASM_PAGE_SIZE),
            });
        }

        if self.memory.guard_regions && self.memory.max_heap_offset < self.memory.max_buffer_length() as u64 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_heap_offset".into(),
                message: "must cover the maximum buffer length when guard regions are enabled".into(),
            });
        }

        Ok(())
    }
}

/// Platform capabilities, resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Upper bound on reserved address space, in bytes.
    pub address_space_cap: usize,
    /// Whether guard-region reservations can be made at all.
    pub guard_regions_supported: bool,
}

impl Capabilities {
    /// Resolve capabilities for the configured address-space width.
    pub fn resolve(config: &MemoryConfig) -> Self {
        Self::for_width(config.address_space)
    }

    /// Capabilities for the given address-space width.
    pub fn for_width(width: AddressSpaceWidth) -> Self {
        // Guard regions only pay off where address space is abundant.
        let (limit, guard_regions_supported) = match width {
            AddressSpaceWidth::Bits64 => (ADDRESS_SPACE_LIMIT_64, true),
            AddressSpaceWidth::Bits32 => (ADDRESS_SPACE_LIMIT_32, false),
        };
        Self {
            address_space_cap: usize::try_from(limit).unwrap_or(usize::MAX),
            guard_regions_supported,
        }
    }

    /// Capabilities of the compilation target.
    pub fn native() -> Self {
        Self::for_width(AddressSpaceWidth::native())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for LinearMemoryConfig.
#[derive(Debug, Clone, Default)]
pub struct LinearMemoryConfigBuilder {
    config: LinearMemoryConfig,
}

impl LinearMemoryConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum linear-memory size in pages.
    pub fn max_mem_pages(mut self, pages: u32) -> Self {
        self.config.memory.max_mem_pages = pages;
        self
    }

    /// Set the offset used to size guard-region reservations.
    pub fn max_heap_offset(mut self, offset: u64) -> Self {
        self.config.memory.max_heap_offset = offset;
        self
    }

    /// Request guard regions by default.
    pub fn guard_regions(mut self, enabled: bool) -> Self {
        self.config.memory.guard_regions = enabled;
        self
    }

    /// Override the address-space width.
    pub fn address_space(mut self, width: AddressSpaceWidth) -> Self {
        self.config.memory.address_space = width;
        self
    }

    /// Set the largest byte length a host buffer can describe.
    pub fn platform_max_buffer_length(mut self, len: usize) -> Self {
        self.config.memory.platform_max_buffer_length = len;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<LinearMemoryConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> LinearMemoryConfig {
        self.config
    }
}

/// Parse an environment variable into any `FromStr` type.
fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}
