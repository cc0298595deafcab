// -
// Configuration

/// Prefix of environment variables overriding configuration
pub(crate) const CONFIG_ENV_PREFIX: &str = "KVSCHED";

/// Environment variable naming an optional configuration file
pub(crate) const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

// -
// Transaction labels

/// Metric / record label of northbound transactions
pub(crate) const TXN_TYPE_NB: &str = "nb_transaction";

/// Metric / record label of southbound notifications
pub(crate) const TXN_TYPE_SB: &str = "sb_notification";

/// Metric / record label of retry passes over failed values
pub(crate) const TXN_TYPE_RETRY: &str = "retry_failed_ops";

/// Label of the implicit dependency of a derived value on its base
pub(crate) const DERIVED_BASE_DEP_LABEL: &str = "base-value";
