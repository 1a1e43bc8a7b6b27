// Postgres error codes used by the proxy
// Class 08 — Connection Exception
pub const CONNECTION_FAILURE: &str = "08006"; // connection_failure
pub const PROTOCOL_VIOLATION: &str = "08P01"; // protocol_violation
// Class 0A — Feature Not Supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000"; // feature_not_supported
// Class 28 — Invalid Authorization Specification
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000"; // invalid_authorization_specification
// Class 53 — Insufficient Resources
pub const OUT_OF_MEMORY: &str = "53200"; // out_of_memory
// Class 57 — Operator Intervention
pub const OPERATOR_INTERVENTION: &str = "57000"; // operator_intervention
pub const ADMIN_SHUTDOWN: &str = "57P01"; // admin_shutdown
pub const CRASH_SHUTDOWN: &str = "57P02"; // crash_shutdown
// Class XX — Internal Error
pub const INTERNAL_ERROR: &str = "XX000"; // internal_error
pub const DATA_CORRUPTED: &str = "XX001"; // data_corrupted
