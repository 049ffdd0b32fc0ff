//! One-time raw token intake.

use std::path::PathBuf;

use tracing::{debug, info, warn};

/// Where a fresh raw token comes from when no stored credential is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenIntake {
    /// Read the token from a file, then delete the file.
    DropFile(PathBuf),
    /// Ask on the terminal without echoing.
    Interactive,
}

/// Why no raw token could be obtained.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("custom token file not found or invalid: {0}")]
    Missing(PathBuf),

    #[error("Failed to read custom token file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token prompt failed: {0}")]
    Prompt(String),
}

impl TokenIntake {
    /// Obtain a raw token.
    pub async fn obtain(&self) -> Result<String, IntakeError> {
        match self {
            Self::DropFile(path) => read_drop_file(path.clone()).await,
            Self::Interactive => tokio::task::spawn_blocking(prompt)
                .await
                .map_err(|e| IntakeError::Prompt(e.to_string()))?,
        }
    }
}

async fn read_drop_file(path: PathBuf) -> Result<String, IntakeError> {
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IntakeError::Missing(path));
        }
        Err(e) => return Err(e.into()),
    };

    let token = contents.trim();
    if token.is_empty() {
        return Err(IntakeError::Missing(path));
    }

    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %e, "Failed to delete custom token file");
    } else {
        debug!(path = %path.display(), "Consumed custom token file");
    }
    Ok(token.to_string())
}

fn prompt() -> Result<String, IntakeError> {
    info!("No usable stored credential, prompting for a custom token");
    let token: String = dialoguer::Password::new()
        .with_prompt("Custom token")
        .interact()
        .map_err(|e| IntakeError::Prompt(e.to_string()))?;
    let token = token.trim();
    if token.is_empty() {
        return Err(IntakeError::Prompt("empty token".to_string()));
    }
    Ok(token.to_string())
}
