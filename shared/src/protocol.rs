/// Default mDNS service type peers announce and browse
pub const DEFAULT_SERVICE_TYPE: &str = "_peershare._tcp.local.";

/// TXT record keys used in peer announcements
pub const TXT_VERSION: &str = "version";
pub const TXT_NODE: &str = "node";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
