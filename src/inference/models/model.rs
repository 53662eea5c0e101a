use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelBase {
    /// The short name of the checkpoint, e.g. "base" or "small.en"
    pub name: String,

    /// The license of the checkpoint
    pub license: String,

    /// The id of the checkpoint repository on the hub
    pub repo_id: String,

    /// The revision of the checkpoint repository
    pub repo_revision: String,
}
