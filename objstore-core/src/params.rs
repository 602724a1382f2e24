//! Query parameters forwarded to a dynamic client

/// Restrictions applied by a list or watch call on a collection
///
/// An unset field does not restrict anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ListParams {
    /// Label selector in its string form, such as `app=web,tier!=db`
    pub label_selector: Option<String>,
    /// Field selector in its string form, such as `status.phase=Running`
    pub field_selector: Option<String>,
    /// Server side timeout of the call, in seconds
    pub timeout: Option<u32>,
    /// Page size of a list call
    pub limit: Option<u32>,
}
