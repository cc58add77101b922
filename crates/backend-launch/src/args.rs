//! Launch argument construction for the backend server.
//!
//! Arguments are kept as an insertion-ordered list of `key → value` pairs.
//! An empty value means "flag present, no value" and is emitted as a bare
//! `--key`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Flag used for the listen host.
pub const LISTEN_FLAG: &str = "listen";
/// Flag used for the listen port.
pub const PORT_FLAG: &str = "port";

/// Insertion-ordered `key → value` launch arguments.
///
/// Inserting an existing key replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchArgs {
    entries: Vec<(String, String)>,
}

impl LaunchArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as CLI arguments. See [`build_launch_args`].
    pub fn to_cli_args(&self) -> Vec<String> {
        build_launch_args(self.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LaunchArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = LaunchArgs::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

impl Serialize for LaunchArgs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LaunchArgs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LaunchArgsVisitor;

        impl<'de> Visitor<'de> for LaunchArgsVisitor {
            type Value = LaunchArgs;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of launch argument names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<LaunchArgs, A::Error> {
                let mut args = LaunchArgs::new();
                while let Some((k, v)) = map.next_entry::<String, String>()? {
                    args.insert(k, v);
                }
                Ok(args)
            }
        }

        deserializer.deserialize_map(LaunchArgsVisitor)
    }
}

/// Build CLI arguments from `key → value` pairs.
///
/// Each pair becomes `--key value`; an empty value emits only `--key`.
/// Input order is preserved.
pub fn build_launch_args<'a, I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (key, value) in args {
        out.push(format!("--{}", key));
        if !value.is_empty() {
            out.push(value.to_string());
        }
    }
    out
}

/// Listen address and user-supplied extra arguments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    pub host: String,
    pub port: u16,
    pub extra_args: LaunchArgs,
}

impl ServerArgs {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            extra_args: LaunchArgs::new(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: LaunchArgs) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Base URL of the backend HTTP server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Paths the backend must use to cooperate with the desktop app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLaunchPaths {
    pub user_directory: PathBuf,
    pub input_directory: PathBuf,
    pub output_directory: PathBuf,
    pub front_end_root: PathBuf,
    pub base_directory: PathBuf,
    pub extra_model_paths_config: PathBuf,
}

impl CoreLaunchPaths {
    /// Standard layout under an installation base path.
    pub fn for_base_path(
        base_path: &Path,
        front_end_root: PathBuf,
        extra_model_paths_config: PathBuf,
    ) -> Self {
        Self {
            user_directory: base_path.join("user"),
            input_directory: base_path.join("input"),
            output_directory: base_path.join("output"),
            front_end_root,
            base_directory: base_path.to_path_buf(),
            extra_model_paths_config,
        }
    }

    pub fn to_launch_args(&self) -> LaunchArgs {
        let path = |p: &PathBuf| p.to_string_lossy().to_string();
        LaunchArgs::from_iter([
            ("user-directory", path(&self.user_directory)),
            ("input-directory", path(&self.input_directory)),
            ("output-directory", path(&self.output_directory)),
            ("front-end-root", path(&self.front_end_root)),
            ("base-directory", path(&self.base_directory)),
            (
                "extra-model-paths-config",
                path(&self.extra_model_paths_config),
            ),
        ])
    }
}

/// Compose the final server arguments.
///
/// User extra arguments come first, then the listen address, then the core
/// arguments. User entries that collide with a launcher-owned key are dropped,
/// so the launcher's values always win.
pub fn compose_server_args(server_args: &ServerArgs, core: &CoreLaunchPaths) -> Vec<String> {
    let core_args = core.to_launch_args();

    let mut owned = LaunchArgs::new();
    owned.insert(LISTEN_FLAG, server_args.host.clone());
    owned.insert(PORT_FLAG, server_args.port.to_string());
    for (k, v) in core_args.iter() {
        owned.insert(k, v);
    }

    let user = server_args
        .extra_args
        .iter()
        .filter(|(k, _)| !owned.contains_key(k));

    build_launch_args(user.chain(owned.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> CoreLaunchPaths {
        CoreLaunchPaths::for_base_path(
            Path::new("/base"),
            PathBuf::from("/app/web"),
            PathBuf::from("/cfg/extra_models_config.yaml"),
        )
    }

    #[test]
    fn test_build_basic_args() {
        let args = build_launch_args([("port", "8188"), ("host", "localhost")]);
        assert_eq!(args, vec!["--port", "8188", "--host", "localhost"]);
    }

    #[test]
    fn test_empty_value_emits_bare_flag() {
        let args = build_launch_args([("cpu", ""), ("port", "8188")]);
        assert_eq!(args, vec!["--cpu", "--port", "8188"]);
    }

    #[test]
    fn test_no_args() {
        let args = build_launch_args(std::iter::empty());
        assert!(args.is_empty());
    }

    #[test]
    fn test_preserves_insertion_order() {
        let args: LaunchArgs = [("z", "3"), ("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(
            args.to_cli_args(),
            vec!["--z", "3", "--a", "1", "--b", "2"]
        );
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut args: LaunchArgs = [("a", "1"), ("b", "2")].into_iter().collect();
        args.insert("a", "9");
        assert_eq!(args.to_cli_args(), vec!["--a", "9", "--b", "2"]);
    }

    #[test]
    fn test_serde_keeps_order() {
        let json = r#"{"z":"1","cpu":"","a":"2"}"#;
        let args: LaunchArgs = serde_json::from_str(json).unwrap();
        assert_eq!(args.to_cli_args(), vec!["--z", "1", "--cpu", "--a", "2"]);
        assert_eq!(serde_json::to_string(&args).unwrap(), json);
    }

    #[test]
    fn test_core_args_win_over_user_args() {
        let extra: LaunchArgs = [
            ("cpu", ""),
            ("output-directory", "/user/choice"),
            ("port", "1"),
        ]
        .into_iter()
        .collect();
        let server_args = ServerArgs::new("127.0.0.1", 8188).with_extra_args(extra);

        let args = compose_server_args(&server_args, &core());

        assert_eq!(args[0], "--cpu");
        assert!(!args.contains(&"/user/choice".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--output-directory").count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "--port").count(), 1);

        let pos = args.iter().position(|a| a == "--output-directory").unwrap();
        assert_eq!(args[pos + 1], "/base/output");
        let pos = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[pos + 1], "8188");
    }

    #[test]
    fn test_core_args_come_last() {
        let server_args = ServerArgs::new("0.0.0.0", 8000)
            .with_extra_args([("preview-method", "auto")].into_iter().collect());
        let args = compose_server_args(&server_args, &core());

        assert_eq!(&args[..2], &["--preview-method", "auto"]);
        assert_eq!(&args[2..6], &["--listen", "0.0.0.0", "--port", "8000"]);
        assert_eq!(args.last().unwrap(), "/cfg/extra_models_config.yaml");
    }
}
