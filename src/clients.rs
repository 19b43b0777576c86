use crate::messaging::ClientId;
use serde::{Deserialize, Serialize};

/// A customer whose books are kept by the office.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

impl Client {
    pub fn new<I: Into<ClientId>, N: Into<String>>(id: I, name: N) -> Self {
        Self { id: id.into(), name: name.into(), active: true }
    }
}
