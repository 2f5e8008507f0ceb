use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Invalid scene: {0}")]
    InvalidScene(String),
    #[error("Invalid render settings: {0}")]
    InvalidSettings(String),
    #[error("Device failure while {context}")]
    Device {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Invalid resource state: {0}")]
    State(String),
    #[error(transparent)]
    Scene(#[from] scene::Error),
}

impl Error {
    pub fn device(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Device {
            context: context.into(),
            source,
        }
    }
}

/// Attaches a context string to device layer failures.
pub trait DeviceContext<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> DeviceContext<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|source| {
            let source = source.into();
            log::error!("Device failure while {context}: {source:#}");
            Error::device(context, source)
        })
    }
}
