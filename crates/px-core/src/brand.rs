//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "P2Proxy";

/// Binary executable name
pub const BIN_NAME: &str = "p2proxy";

