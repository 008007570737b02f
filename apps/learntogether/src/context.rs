//! Persistent per-user application state.
//!
//! Holds the signed-in identity, the counterpart book and a few endpoint
//! overrides. Hydrated from a TOML file at startup, written back on every
//! change, wiped on logout.

use conversation_id::{ConversationId, CounterpartBook};
use directories::BaseDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
    #[error("unable to determine home directory")]
    NoHomeDirectory,
    #[error("not signed in")]
    NotSignedIn,
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl From<toml::de::Error> for ContextError {
    fn from(value: toml::de::Error) -> Self {
        ContextError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for ContextError {
    fn from(value: toml::ser::Error) -> Self {
        ContextError::Toml(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_api_url: Option<String>,
}

// Plain values must precede tables for TOML serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub counterparts: CounterpartBook,
}

pub struct AppContext {
    path: PathBuf,
    state: RwLock<ContextState>,
}

impl AppContext {
    /// `~/.learntogether/context.toml`
    pub fn default_path() -> Result<PathBuf, ContextError> {
        let base = BaseDirs::new().ok_or(ContextError::NoHomeDirectory)?;
        Ok(base.home_dir().join(".learntogether").join("context.toml"))
    }

    /// Loads the context stored at `path`; a missing file yields an empty
    /// context.
    pub fn hydrate(path: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        } else {
            ContextState::default()
        };
        tracing::debug!(
            target = "context",
            path = %path.display(),
            signed_in = state.user_id.is_some(),
            "context hydrated"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> ContextState {
        self.state.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state.read().token.clone()
    }

    pub fn display_name(&self) -> Option<String> {
        self.state.read().display_name.clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.state.read().user_id.is_some()
    }

    pub fn settings(&self) -> Settings {
        self.state.read().settings.clone()
    }

    pub fn counterparts(&self) -> CounterpartBook {
        self.state.read().counterparts.clone()
    }

    pub fn sign_in(
        &self,
        user_id: &str,
        token: &str,
        display_name: Option<&str>,
    ) -> Result<(), ContextError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ContextError::Empty("user id"));
        }
        if token.trim().is_empty() {
            return Err(ContextError::Empty("token"));
        }
        {
            let mut state = self.state.write();
            if state.user_id.as_deref() != Some(user_id) {
                // Counterparts belong to the previous identity.
                state.counterparts.clear();
            }
            state.user_id = Some(user_id.to_string());
            state.token = Some(token.trim().to_string());
            state.display_name = display_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }
        tracing::info!(target = "context", user_id, "signed in");
        self.persist()
    }

    /// Forgets everything, including settings, and removes the file.
    pub fn logout(&self) -> Result<(), ContextError> {
        *self.state.write() = ContextState::default();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(target = "context", "signed out");
        Ok(())
    }

    /// Records the signed-in user's counterpart in `conversation`.
    pub fn record_counterpart(&self, conversation: &ConversationId) -> Result<bool, ContextError> {
        let recorded = self.update_counterparts(|book, me| book.record(conversation, me))?;
        Ok(recorded)
    }

    /// Applies `f` to the counterpart book and persists the result.
    pub fn update_counterparts<R>(
        &self,
        f: impl FnOnce(&mut CounterpartBook, &str) -> R,
    ) -> Result<R, ContextError> {
        let result = {
            let mut state = self.state.write();
            let state = &mut *state;
            let me = state.user_id.as_deref().ok_or(ContextError::NotSignedIn)?;
            f(&mut state.counterparts, me)
        };
        self.persist()?;
        Ok(result)
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<(), ContextError> {
        f(&mut self.state.write().settings);
        self.persist()
    }

    /// Writes the current state to disk, readable by the owner only.
    pub fn persist(&self) -> Result<(), ContextError> {
        let serialized = toml::to_string_pretty(&*self.state.read())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_hydrates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::hydrate(dir.path().join("context.toml")).unwrap();
        assert!(!ctx.is_signed_in());
        assert_eq!(ctx.snapshot(), ContextState::default());
    }

    #[test]
    fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("context.toml");
        {
            let ctx = AppContext::hydrate(&path).unwrap();
            ctx.sign_in("u1", "secret", Some("Ada")).unwrap();
            ctx.update_settings(|s| s.relay_url = Some("ws://relay.test/ws".into()))
                .unwrap();
            let conversation = ConversationId::for_resource("book-1", "u2", "u1");
            assert!(ctx.record_counterpart(&conversation).unwrap());
        }

        let ctx = AppContext::hydrate(&path).unwrap();
        assert_eq!(ctx.user_id().as_deref(), Some("u1"));
        assert_eq!(ctx.token().as_deref(), Some("secret"));
        assert_eq!(ctx.display_name().as_deref(), Some("Ada"));
        assert_eq!(ctx.settings().relay_url.as_deref(), Some("ws://relay.test/ws"));
        assert_eq!(ctx.counterparts().latest("book-1"), Some("u2"));
    }

    #[test]
    fn logout_clears_state_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.toml");
        let ctx = AppContext::hydrate(&path).unwrap();
        ctx.sign_in("u1", "secret", None).unwrap();
        assert!(path.exists());

        ctx.logout().unwrap();
        assert!(!path.exists());
        assert_eq!(ctx.snapshot(), ContextState::default());
        ctx.logout().unwrap();
    }

    #[test]
    fn counterparts_require_sign_in() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::hydrate(dir.path().join("context.toml")).unwrap();
        let conversation = ConversationId::for_resource("book-1", "u2", "u1");
        assert!(matches!(
            ctx.record_counterpart(&conversation),
            Err(ContextError::NotSignedIn)
        ));
    }

    #[test]
    fn switching_users_drops_old_counterparts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::hydrate(dir.path().join("context.toml")).unwrap();
        ctx.sign_in("u1", "t1", None).unwrap();
        ctx.record_counterpart(&ConversationId::for_resource("book-1", "u1", "u2"))
            .unwrap();
        ctx.sign_in("u3", "t3", None).unwrap();
        assert!(ctx.counterparts().is_empty());
    }

    #[test]
    fn rejects_blank_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::hydrate(dir.path().join("context.toml")).unwrap();
        assert!(matches!(ctx.sign_in(" ", "t", None), Err(ContextError::Empty(_))));
        assert!(matches!(ctx.sign_in("u1", "", None), Err(ContextError::Empty(_))));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.toml");
        fs::write(&path, "user_id = [").unwrap();
        assert!(matches!(AppContext::hydrate(&path), Err(ContextError::Toml(_))));
    }
}
