//! Error kinds raised while driving a question to an answer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The inference handle could not be constructed.
    #[error("Erro ao inicializar modelo: {0}")]
    ModelLoad(String),

    /// The loaded model failed to produce output.
    #[error("{0}")]
    Inference(String),

    /// Reading process memory failed.
    #[error("Erro ao ler uso de memória: {0}")]
    MemoryRead(String),

    #[error("configuração inválida: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
