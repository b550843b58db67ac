use thiserror::Error;

pub type Result<T> = std::result::Result<T, InstancingError>;

#[derive(Debug, Error)]
pub enum InstancingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("GLB container error: {0}")]
    Glb(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{kind} index {index} is out of range")]
    InvalidIndex { kind: &'static str, index: usize },
    #[error("accessor {accessor} has an invalid element or component type")]
    MalformedAccessor { accessor: usize },
    #[error(
        "accessor {accessor}: {count} elements at offset {offset} with stride {stride} \
         exceed buffer of {buffer_len} bytes"
    )]
    AccessorOutOfBounds {
        accessor: usize,
        offset: usize,
        stride: usize,
        count: usize,
        buffer_len: usize,
    },
    #[error("bufferView {view}: {length} bytes at offset {offset} exceed buffer of {buffer_len} bytes")]
    BufferViewOutOfBounds {
        view: usize,
        offset: usize,
        length: usize,
        buffer_len: usize,
    },
    #[error("accessor {accessor} has no in-memory backing data (external buffer uri?)")]
    AccessorDataUnavailable { accessor: usize },
    #[error("failed to serialize glTF document: {0}")]
    Serialize(String),
}
