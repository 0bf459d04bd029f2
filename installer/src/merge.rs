//! Deep merge of configuration fragments into the global configuration.
//!
//! Mappings merge key by key, recursing where both sides hold a mapping.
//! Any other collision is resolved in favour of the incoming value, so
//! sequences and scalars are replaced wholesale rather than combined.

use camino::Utf8Path;
use serde_yaml::{Mapping, Value};
use std::fs;

/// File name of the merged configuration written under the plugins root.
pub const GLOBAL_CONFIG_FILE_NAME: &str = "app-config.dynamic-plugins.yaml";

/// Reserved top-level key holding the plugins root description.
pub const SEED_KEY: &str = "dynamicPlugins";

/// Root directory name advertised in the seed entry.
pub const SEED_ROOT_DIRECTORY: &str = "dynamic-plugins-root";

/// Merge `source` into `destination` in place.
///
/// # Examples
///
/// ```
/// use dynamic_plugins_installer::merge::deep_merge;
/// use serde_yaml::Mapping;
///
/// let mut dest: Mapping = serde_yaml::from_str("a: {b: 1}").unwrap();
/// let src: Mapping = serde_yaml::from_str("a: {c: 2}").unwrap();
/// deep_merge(&src, &mut dest);
/// let expected: Mapping = serde_yaml::from_str("a: {b: 1, c: 2}").unwrap();
/// assert_eq!(dest, expected);
/// ```
pub fn deep_merge(source: &Mapping, destination: &mut Mapping) {
    for (key, incoming) in source {
        match (destination.get_mut(key), incoming) {
            (Some(Value::Mapping(existing)), Value::Mapping(nested)) => {
                deep_merge(nested, existing);
            }
            _ => {
                destination.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// The configuration document assembled over one installation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    tree: Mapping,
}

impl GlobalConfig {
    /// Create a configuration holding only the plugins root seed entry.
    #[must_use]
    pub fn seeded() -> Self {
        let mut root = Mapping::new();
        root.insert(
            Value::from("rootDirectory"),
            Value::from(SEED_ROOT_DIRECTORY),
        );
        let mut tree = Mapping::new();
        tree.insert(Value::from(SEED_KEY), Value::Mapping(root));
        Self { tree }
    }

    /// Deep-merge one plugin's fragment into the configuration.
    pub fn merge_fragment(&mut self, fragment: &Mapping) {
        deep_merge(fragment, &mut self.tree);
    }

    /// Borrow the underlying tree.
    #[must_use]
    pub fn as_mapping(&self) -> &Mapping {
        &self.tree
    }

    /// Serialize the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be represented as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.tree)
    }

    /// Serialize the configuration and write it to `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if serialization or the write fails.
    pub fn write_to(&self, path: &Utf8Path) -> std::io::Result<()> {
        let yaml = self.to_yaml().map_err(std::io::Error::other)?;
        fs::write(path, yaml)
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).expect("test mapping")
    }

    #[rstest]
    #[case::disjoint_nested("a: {b: 1}", "a: {c: 2}", "a: {b: 1, c: 2}")]
    #[case::scalar_replaced_by_tree("a: 1", "a: {b: 1}", "a: {b: 1}")]
    #[case::tree_replaced_by_scalar("a: {b: 1}", "a: 2", "a: 2")]
    #[case::sequences_replaced("a: [1, 2]", "a: [3]", "a: [3]")]
    #[case::deep_leaf_overwrite("a: {b: {c: 1, d: 2}}", "a: {b: {c: 9}}", "a: {b: {c: 9, d: 2}}")]
    #[case::null_overwrites("a: 1", "a: ~", "a: ~")]
    fn merges_in_application_order(#[case] first: &str, #[case] second: &str, #[case] expected: &str) {
        let mut dest = Mapping::new();
        deep_merge(&mapping(first), &mut dest);
        deep_merge(&mapping(second), &mut dest);
        assert_eq!(dest, mapping(expected));
    }

    #[test]
    fn merging_empty_source_is_a_no_op() {
        let mut dest = mapping("a: {b: 1}");
        deep_merge(&Mapping::new(), &mut dest);
        assert_eq!(dest, mapping("a: {b: 1}"));
    }

    #[test]
    fn seeded_config_describes_root_directory() {
        let config = GlobalConfig::seeded();
        assert_eq!(
            config.as_mapping(),
            &mapping("dynamicPlugins: {rootDirectory: dynamic-plugins-root}")
        );
    }

    #[test]
    fn fragments_can_extend_the_seed_key() {
        let mut config = GlobalConfig::seeded();
        config.merge_fragment(&mapping("dynamicPlugins: {frontend: {foo: {}}}"));
        let seed = config
            .as_mapping()
            .get(SEED_KEY)
            .and_then(Value::as_mapping)
            .expect("seed mapping");
        assert!(seed.contains_key("rootDirectory"));
        assert!(seed.contains_key("frontend"));
    }

    #[test]
    fn write_to_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = camino::Utf8PathBuf::try_from(temp.path().join(GLOBAL_CONFIG_FILE_NAME))
            .expect("utf8 temp path");
        let mut config = GlobalConfig::seeded();
        config.merge_fragment(&mapping("app: {title: Portal}"));
        config.write_to(&path).expect("write config");

        let written: Mapping =
            serde_yaml::from_str(&fs::read_to_string(&path).expect("read back")).expect("yaml");
        assert_eq!(&written, config.as_mapping());
    }
}
