//! The `zks` command line.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::StoreConfig;
use crate::store::{Entry, ZkStore};

/// Object storage on a ZooKeeper ensemble.
#[derive(Debug, Parser)]
#[command(name = "zks")]
#[command(about = "Object storage on a ZooKeeper ensemble", long_about = None)]
pub struct Cli {
    /// Comma-separated `host:port` list.
    #[arg(short, long, env = "ZKSTORE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Znode under which objects live.
    #[arg(short, long)]
    pub root: Option<String>,

    /// TOML or JSON config file; flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print an object to stdout.
    Read {
        /// Object key.
        path: String,
    },
    /// Write an object from an argument or stdin.
    Write {
        /// Object key.
        path: String,
        /// Payload; read from stdin when omitted.
        data: Option<String>,
    },
    /// Delete an object or directory.
    Rm {
        /// Object key.
        path: String,
        /// Remove everything below the path too.
        #[arg(short = 'R', long)]
        recursive: bool,
    },
    /// Show metadata.
    Stat {
        /// Object key.
        path: String,
    },
    /// List a directory.
    Ls {
        /// Directory key.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory and its parents.
    Mkdir {
        /// Directory key.
        path: String,
    },
}

impl Cli {
    /// Store configuration from the config file and flags.
    pub fn store_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StoreConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoints = StoreConfig::with_endpoints(endpoint).endpoints;
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Runs the subcommand.
    pub async fn run(self) -> Result<()> {
        let store = ZkStore::new(self.store_config()?)?;
        let result = self.execute(&store).await;
        store.shutdown().await;
        result
    }

    async fn execute(&self, store: &ZkStore) -> Result<()> {
        match &self.command {
            Command::Read { path } => {
                let data = store.read(path).await?;
                std::io::stdout().write_all(&data)?;
            }
            Command::Write { path, data } => {
                let payload = match data {
                    Some(data) => data.clone().into_bytes(),
                    None => {
                        let mut buf = Vec::new();
                        std::io::stdin().read_to_end(&mut buf)?;
                        buf
                    }
                };
                store.write(path, &payload).await?;
            }
            Command::Rm { path, recursive } => {
                if *recursive {
                    store.delete_all(path).await?;
                } else {
                    store.delete(path).await?;
                }
            }
            Command::Stat { path } => {
                let entry = store.stat(path).await?;
                println!("Path: {}", entry.path);
                println!("Type: {}", if entry.is_dir { "directory" } else { "object" });
                println!("Size: {}", format_bytes(entry.content_length));
                println!("Version: {}", entry.version);
                println!("Children: {}", entry.children);
                if let Some(modified) = entry.last_modified {
                    println!("Modified: {}", modified.to_rfc3339());
                }
            }
            Command::Ls { path } => {
                for entry in store.list(path).await? {
                    println!("{}", format_entry(&entry));
                }
            }
            Command::Mkdir { path } => store.create_dir(path).await?,
        }
        Ok(())
    }
}

fn format_entry(entry: &Entry) -> String {
    let modified = entry
        .last_modified
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let name = if entry.is_dir {
        format!("{}/", entry.name())
    } else {
        entry.name().to_string()
    };
    format!(
        "{:>10} {:<19} {}",
        format_bytes(entry.content_length),
        modified,
        name
    )
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ObjectPath;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["zks", "rm", "-R", "a/b"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Rm { ref path, recursive: true } if path == "a/b"
        ));

        let cli = Cli::try_parse_from(["zks", "ls"]).unwrap();
        assert!(matches!(cli.command, Command::Ls { ref path } if path == "/"));

        let cli = Cli::try_parse_from(["zks", "write", "k"]).unwrap();
        assert!(matches!(cli.command, Command::Write { data: None, .. }));
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "endpoints = \"a:2181\"\nroot = \"/from-file\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "zks",
            "--config",
            &path,
            "--endpoint",
            "b:2181,c:2181",
            "stat",
            "k",
        ])
        .unwrap();
        let config = cli.store_config().unwrap();
        assert_eq!(config.endpoints, vec!["b:2181", "c:2181"]);
        assert_eq!(config.root, "/from-file");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let cli = Cli::try_parse_from(["zks", "--endpoint", "", "stat", "k"]).unwrap();
        assert!(cli.store_config().is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_format_entry_marks_directories() {
        let entry = Entry {
            path: ObjectPath::parse("a/dir").unwrap(),
            content_length: 0,
            is_dir: true,
            last_modified: None,
            version: 0,
            children: 2,
        };
        assert!(format_entry(&entry).ends_with(" dir/"));
    }
}
