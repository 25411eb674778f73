use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("row {id} not found in {table}")]
    RowNotFound { table: String, id: String },
    #[error("draft id {id} collides with an existing row in {table}")]
    IdCollision { table: String, id: String },
    #[error("edit to row {id} in {table} would change its id")]
    IdChanged { table: String, id: String },
    #[error("draft add to {table} specifies its own numeric id {id}")]
    DraftIdSpecified { table: String, id: String },
    #[error("no draft ids left in {table}")]
    DraftIdsExhausted { table: String },
    #[error("row {id} in {table} is draft deleted")]
    DraftDeleted { table: String, id: String },
    #[error("edits are pending in {table}")]
    EditsPending { table: String },
    #[error("cannot decode {table} row: {reason}")]
    Decode { table: String, reason: String },
    #[error("response not sensible: {0}")]
    Malformed(String),
    #[error("invalid node url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("not connected to a node")]
    NotConnected,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
