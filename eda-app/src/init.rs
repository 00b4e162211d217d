//! `eda-whatsapp init`: writes a starter config, seeding access and endpoint
//! keys from the environment so a `.env`-driven deployment starts from its own values.

use crate::config::{EdaConfig, default_config_path, split_list};
use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const TEMPLATE: &str = include_str!("../../config-templates/whatsapp.toml");

struct SeededKey {
    section: &'static str,
    key: &'static str,
    var: &'static str,
    list: bool,
}

const SEEDED_KEYS: &[SeededKey] = &[
    SeededKey {
        section: "access",
        key: "allowed_users",
        var: "ALLOWED_USERS",
        list: true,
    },
    SeededKey {
        section: "access",
        key: "blocked_users",
        var: "BLOCKED_USERS",
        list: true,
    },
    SeededKey {
        section: "ai_api",
        key: "base_url",
        var: "AI_API_BASE_URL",
        list: false,
    },
    SeededKey {
        section: "transport",
        key: "bridge_url",
        var: "WA_BRIDGE_URL",
        list: false,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created {
        path: PathBuf,
        /// Environment variables whose values were written into the file.
        seeded: Vec<&'static str>,
    },
    Existing(PathBuf),
}

pub async fn init_config(path: Option<PathBuf>) -> Result<InitOutcome> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    write_config(&path, |key| std::env::var(key).ok()).await
}

/// Never overwrites: an existing file is reported and left alone.
pub async fn write_config<F>(path: &Path, lookup: F) -> Result<InitOutcome>
where
    F: Fn(&str) -> Option<String>,
{
    let (contents, seeded) = render_template(lookup)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Ok(InitOutcome::Existing(path.to_path_buf()));
        }
        Err(e) => return Err(anyhow!("create config {}: {e}", path.display())),
    };
    file.write_all(contents.as_bytes())
        .await
        .with_context(|| format!("write config {}", path.display()))?;
    file.flush().await?;

    tracing::info!(path = %path.display(), seeded = ?seeded, "config written");
    Ok(InitOutcome::Created {
        path: path.to_path_buf(),
        seeded,
    })
}

/// Fills seeded keys in place, keeping the template's comments, then checks
/// the result loads as a valid config.
fn render_template<F>(lookup: F) -> Result<(String, Vec<&'static str>)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut section = "";
    let mut seeded = Vec::new();
    let mut out = String::with_capacity(TEMPLATE.len());

    for line in TEMPLATE.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            section = name;
        }
        let replacement = SEEDED_KEYS
            .iter()
            .filter(|seed| seed.section == section && assigns(trimmed, seed.key))
            .find_map(|seed| {
                let raw = lookup(seed.var).filter(|v| !v.trim().is_empty())?;
                Some((seed, raw))
            });
        match replacement {
            Some((seed, raw)) => {
                let value = if seed.list {
                    toml::Value::Array(split_list(&raw).into_iter().map(toml::Value::String).collect())
                } else {
                    toml::Value::String(raw.trim().to_string())
                };
                out.push_str(&format!("{} = {value}", seed.key));
                seeded.push(seed.var);
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    let cfg: EdaConfig = toml::from_str(&out).context("parse generated config")?;
    cfg.validate().context("generated config is invalid")?;
    Ok((out, seeded))
}

fn assigns(line: &str, key: &str) -> bool {
    line.strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn writes_template_once_and_keeps_local_edits() {
        let path = temp_dir("eda-init").join("nested").join("whatsapp.toml");

        let first = write_config(&path, env(&[])).await.expect("first init");
        assert_eq!(
            first,
            InitOutcome::Created {
                path: path.clone(),
                seeded: Vec::new(),
            }
        );
        assert_eq!(std::fs::read_to_string(&path).expect("read"), TEMPLATE);

        std::fs::write(&path, "[bot]\ncmd_prefix = \"/\"\n").expect("local edit");
        let second = write_config(&path, env(&[("WA_BRIDGE_URL", "http://bridge:3001")]))
            .await
            .expect("second init");
        assert_eq!(second, InitOutcome::Existing(path.clone()));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "[bot]\ncmd_prefix = \"/\"\n"
        );
    }

    #[tokio::test]
    async fn seeds_access_and_endpoints_from_environment() {
        let path = temp_dir("eda-init").join("whatsapp.toml");
        let outcome = write_config(
            &path,
            env(&[
                ("ALLOWED_USERS", "5511999999999, 5511888888888,"),
                ("WA_BRIDGE_URL", " http://bridge.internal:3001 "),
                ("BLOCKED_USERS", "  "),
            ]),
        )
        .await
        .expect("init");
        let InitOutcome::Created { seeded, .. } = outcome else {
            panic!("expected a new file");
        };
        assert_eq!(seeded, vec!["ALLOWED_USERS", "WA_BRIDGE_URL"]);

        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(contents.contains("# Phone numbers without the server suffix."));
        let cfg: EdaConfig = toml::from_str(&contents).expect("parse written config");
        assert_eq!(
            cfg.access.allowed_users,
            vec!["5511999999999".to_string(), "5511888888888".to_string()]
        );
        assert!(cfg.access.blocked_users.is_empty());
        assert_eq!(cfg.transport.bridge_url, "http://bridge.internal:3001");
        assert_eq!(cfg.ai_api.base_url, "http://localhost:8083");
    }

    #[tokio::test]
    async fn invalid_seed_is_rejected_before_writing() {
        let path = temp_dir("eda-init").join("whatsapp.toml");
        let err = write_config(&path, env(&[("WA_BRIDGE_URL", "ws://bridge:3001")]))
            .await
            .expect_err("websocket url rejected");
        assert!(format!("{err:#}").contains("transport.bridge_url"), "got: {err:#}");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn written_template_loads() {
        let path = temp_dir("eda-init").join("whatsapp.toml");
        write_config(&path, env(&[])).await.expect("init");

        let cfg = EdaConfig::load(Some(path)).await.expect("template loads");
        assert_eq!(cfg.bot.cmd_prefix, "!");
    }
}
