use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wopi_storage::{Authorization, StorageError, StorageSettings};

/// Configuration for the wopi-storage command-line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "wopi-storage")]
#[command(about = "Fetch, lock and save documents held by a WOPI host or on the local filesystem")]
pub struct Config {
    /// Storage settings file (JSON)
    #[arg(long, env = "WOPI_STORAGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the document jails
    #[arg(long, default_value = "./jails", env = "WOPI_STORAGE_JAIL_ROOT")]
    pub jail_root: PathBuf,

    /// Document directory inside the jail
    #[arg(long, default_value = "/doc", env = "WOPI_STORAGE_JAIL_PATH")]
    pub jail_path: PathBuf,

    /// Access token presented to the WOPI host
    #[arg(long, env = "WOPI_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Raw authorization headers ("Name: value", CRLF separated)
    #[arg(
        long,
        env = "WOPI_AUTH_HEADER",
        hide_env_values = true,
        conflicts_with = "access_token"
    )]
    pub auth_header: Option<String>,

    /// Allow local filesystem documents regardless of the settings file
    #[arg(long)]
    pub allow_filesystem: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the document metadata (CheckFileInfo)
    CheckFileInfo {
        /// Document URL or path
        location: String,
    },

    /// Copy the document into the jail (GetFile)
    GetFile {
        location: String,

        /// Create the document from this template instead
        #[arg(long)]
        template: Option<String>,
    },

    /// Take the document lock and print its token
    Lock {
        location: String,

        /// Refresh a lock taken earlier under this token
        #[arg(long)]
        lock_token: Option<String>,
    },

    /// Release a document lock
    Unlock {
        location: String,

        /// Token the lock was taken with
        #[arg(long)]
        lock_token: String,
    },

    /// Upload a file as the document content (PutFile)
    PutFile {
        location: String,

        /// File to upload
        source: PathBuf,

        /// Store as a new document with this name (PutRelativeFile)
        #[arg(long, conflicts_with = "rename")]
        save_as: Option<String>,

        /// Rename the document while saving (RenameFile)
        #[arg(long)]
        rename: Option<String>,

        /// Overwrite even if the document changed on the host
        #[arg(long)]
        force: bool,

        /// Lock token to present, when the document is locked
        #[arg(long)]
        lock_token: Option<String>,
    },
}

impl Command {
    pub fn location(&self) -> &str {
        match self {
            Command::CheckFileInfo { location }
            | Command::GetFile { location, .. }
            | Command::Lock { location, .. }
            | Command::Unlock { location, .. }
            | Command::PutFile { location, .. } => location,
        }
    }
}

impl Config {
    pub fn authorization(&self) -> Authorization {
        if let Some(token) = &self.access_token {
            Authorization::Token(token.clone())
        } else if let Some(header) = &self.auth_header {
            Authorization::Header(header.clone())
        } else {
            Authorization::None
        }
    }

    /// The settings file, or defaults, with command-line overrides applied.
    pub fn load_settings(&self) -> Result<StorageSettings, StorageError> {
        let mut settings = match &self.config {
            Some(path) => StorageSettings::from_file(path)?,
            None => StorageSettings::default(),
        };
        if self.allow_filesystem {
            settings.filesystem.allow = true;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_file_arguments() {
        let config = Config::try_parse_from([
            "wopi-storage",
            "--access-token",
            "tok",
            "put-file",
            "https://wopi.example.com/wopi/files/1",
            "out.odt",
            "--save-as",
            "copy.odt",
        ])
        .unwrap();

        assert_eq!(config.authorization(), Authorization::Token("tok".to_string()));
        assert_eq!(config.command.location(), "https://wopi.example.com/wopi/files/1");
        match config.command {
            Command::PutFile {
                source,
                save_as,
                rename,
                force,
                ..
            } => {
                assert_eq!(source, PathBuf::from("out.odt"));
                assert_eq!(save_as.as_deref(), Some("copy.odt"));
                assert!(rename.is_none());
                assert!(!force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_save_as_conflicts_with_rename() {
        let parsed = Config::try_parse_from([
            "wopi-storage",
            "put-file",
            "doc.odt",
            "out.odt",
            "--save-as",
            "a.odt",
            "--rename",
            "b.odt",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_allow_filesystem_override() {
        let config =
            Config::try_parse_from(["wopi-storage", "--allow-filesystem", "check-file-info", "doc.odt"])
                .unwrap();
        assert_eq!(config.authorization(), Authorization::None);
        assert!(config.load_settings().unwrap().filesystem.allow);
    }
}
