use crate::core::{DbError, Encoding, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARTITION: &str = "default";
const URL_SCHEME: &str = "kvsession://";

/// Filter-policy configuration.
///
/// Accepted for interface compatibility with engines that build per-table
/// filters. It is stored and reported but has no effect on reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterPolicy {
    Bloom { bits_per_key: u32 },
}

impl FilterPolicy {
    pub fn bloom(bits_per_key: u32) -> Self {
        FilterPolicy::Bloom { bits_per_key }
    }
}

/// Database configuration
///
/// Shared by every session of one storage location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// Partition used by the root session
    pub partition: String,

    /// Schema version to open at; `None` opens at the stored version
    pub schema_version: Option<u32>,

    /// Maximum number of recycled batch buffers kept per batch kind
    pub batch_pool_size: usize,

    /// Number of entries an iterator fetches per window
    pub iterator_high_water: usize,

    /// Key encoding of the root session
    pub key_encoding: Encoding,

    /// Value encoding of the root session
    pub value_encoding: Encoding,

    /// Placeholder filter policy (no behavioral effect)
    pub filter_policy: Option<FilterPolicy>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            partition: DEFAULT_PARTITION.to_string(),
            schema_version: None,
            batch_pool_size: 16,
            iterator_high_water: 64,
            key_encoding: Encoding::Utf8,
            value_encoding: Encoding::Utf8,
            filter_policy: None,
        }
    }
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root partition
    pub fn partition(mut self, partition: &str) -> Self {
        self.partition = partition.to_string();
        self
    }

    /// Set the schema version to open at
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Set the batch pool bound
    pub fn batch_pool_size(mut self, size: usize) -> Self {
        self.batch_pool_size = size;
        self
    }

    /// Set the iterator window size
    pub fn iterator_high_water(mut self, entries: usize) -> Self {
        self.iterator_high_water = entries;
        self
    }

    /// Set the key encoding
    pub fn key_encoding(mut self, encoding: Encoding) -> Self {
        self.key_encoding = encoding;
        self
    }

    /// Set the value encoding
    pub fn value_encoding(mut self, encoding: Encoding) -> Self {
        self.value_encoding = encoding;
        self
    }

    /// Set the filter policy placeholder
    pub fn filter_policy(mut self, policy: FilterPolicy) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Parse options from a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| DbError::ConfigError(format!("invalid options json: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Parse from a location URL
    ///
    /// Format: "kvsession://location?partition=name&pool=16&window=64&keys=utf8&values=json"
    ///
    /// Returns the location together with the options.
    ///
    /// # Examples
    ///
    /// ```
    /// use kvsession::DbOptions;
    ///
    /// let (location, options) =
    ///     DbOptions::from_url("kvsession://app-data?partition=users&values=json").unwrap();
    /// assert_eq!(location, "app-data");
    /// assert_eq!(options.partition, "users");
    /// ```
    pub fn from_url(url: &str) -> Result<(String, Self)> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| DbError::ConfigError(format!("URL must start with '{}'", URL_SCHEME)))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        if location.is_empty() {
            return Err(DbError::ConfigError("URL has no location".into()));
        }

        let mut options = Self::default();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::ConfigError(format!("malformed parameter '{}'", pair)))?;
            match key {
                "partition" => options.partition = value.to_string(),
                "version" => options.schema_version = Some(parse_number(key, value)?),
                "pool" => options.batch_pool_size = parse_number(key, value)?,
                "window" => options.iterator_high_water = parse_number(key, value)?,
                "keys" => options.key_encoding = value.parse()?,
                "values" => options.value_encoding = value.parse()?,
                "bloom" => options.filter_policy = Some(FilterPolicy::bloom(parse_number(key, value)?)),
                other => {
                    return Err(DbError::ConfigError(format!("unknown parameter '{}'", other)));
                }
            }
        }

        options.validate()?;
        Ok((location.to_string(), options))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.partition.is_empty() {
            return Err(DbError::ConfigError("partition must not be empty".into()));
        }
        if self.iterator_high_water == 0 {
            return Err(DbError::ConfigError("iterator_high_water must be > 0".into()));
        }
        if self.schema_version == Some(0) {
            return Err(DbError::ConfigError("schema_version must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DbError::ConfigError(format!("parameter '{}' expects a number, got '{}'", key, value)))
}
