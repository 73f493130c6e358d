pub mod url_validation;
pub use url_validation::{
    HostResolver, SystemResolver, UrlPolicy, UrlValidationError, check_resolved_host,
    validate_tool_url,
};
