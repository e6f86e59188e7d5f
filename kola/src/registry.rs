//! Test definitions and the registry they live in.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::future::BoxFuture;
use globset::GlobBuilder;
use kola_platform::TestCluster;

use crate::error::RegistryError;

/// A test body. Runs on the host against a live cluster.
pub type RunFn = fn(TestCluster) -> BoxFuture<'static, anyhow::Result<()>>;

/// A native function. Runs on a machine, invoked through `kolet`.
pub type NativeFn = fn() -> anyhow::Result<()>;

/// A registered integration test.
#[derive(Clone)]
pub struct Test {
    /// Unique name, e.g. `etcd.Discovery`.
    pub name: String,
    /// Test body.
    pub run: RunFn,
    /// Functions `kolet` can run on the machines, by name.
    pub native_funcs: BTreeMap<&'static str, NativeFn>,
    /// Config template handed to every machine.
    pub cloud_config: String,
    /// Number of machines.
    pub cluster_size: usize,
    /// Platforms the test runs on; `None` means the runner's defaults.
    pub platforms: Option<Vec<String>>,
}

impl Test {
    /// A single-machine test with an empty config.
    pub fn new(name: impl Into<String>, run: RunFn) -> Self {
        Self {
            name: name.into(),
            run,
            native_funcs: BTreeMap::new(),
            cloud_config: String::new(),
            cluster_size: 1,
            platforms: None,
        }
    }

    /// Set the config template.
    pub fn cloud_config(mut self, template: impl Into<String>) -> Self {
        self.cloud_config = template.into();
        self
    }

    /// Set the number of machines.
    pub fn cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    /// Restrict the test to these platforms.
    pub fn platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = Some(platforms.into_iter().map(Into::into).collect());
        self
    }

    /// Add a native function.
    pub fn native_func(mut self, name: &'static str, func: NativeFn) -> Self {
        self.native_funcs.insert(name, func);
        self
    }

    /// Whether `kolet` has to be deployed for this test.
    pub fn has_native_funcs(&self) -> bool {
        !self.native_funcs.is_empty()
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name)
            .field("native_funcs", &self.native_funcs.keys().collect::<Vec<_>>())
            .field("cluster_size", &self.cluster_size)
            .field("platforms", &self.platforms)
            .finish_non_exhaustive()
    }
}

/// All known tests, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    tests: BTreeMap<String, Test>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a test. An existing test with the same name is never replaced.
    pub fn register(&mut self, test: Test) -> Result<(), RegistryError> {
        if self.tests.contains_key(&test.name) {
            return Err(RegistryError::DuplicateName(test.name));
        }
        self.tests.insert(test.name.clone(), test);
        Ok(())
    }

    /// Look a test up by exact name.
    pub fn get(&self, name: &str) -> Option<&Test> {
        self.tests.get(name)
    }

    /// Look up native function `func` of test `test`.
    pub fn native_func(&self, test: &str, func: &str) -> Option<NativeFn> {
        self.get(test)?.native_funcs.get(func).copied()
    }

    /// Tests whose name matches the glob `pattern`, in name order.
    ///
    /// `*` and `?` do not match `/`. Braces are plain characters.
    pub fn select(&self, pattern: &str) -> Result<Vec<&Test>, globset::Error> {
        let pattern = literal_braces(pattern);
        let matcher = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        Ok(self
            .tests
            .values()
            .filter(|t| matcher.is_match(&t.name))
            .collect())
    }

    /// Every test, in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Test> {
        self.tests.values()
    }

    /// Every test name, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    /// Number of registered tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Rewrite `{` and `}` outside character classes as one-member classes,
/// so they match themselves instead of forming alternations.
fn literal_braces(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push(c);
                if let Some(&neg) = chars.peek().filter(|&&n| n == '!' || n == '^') {
                    out.push(neg);
                    chars.next();
                }
                // A leading `]` is a member, not the end of the class.
                if let Some(&close) = chars.peek().filter(|&&n| n == ']') {
                    out.push(close);
                    chars.next();
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(c);
            }
            '{' | '}' if !in_class => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn noop(_: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn hello() -> anyhow::Result<()> {
        Ok(())
    }

    fn registry(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for name in names {
            registry.register(Test::new(*name, noop)).unwrap();
        }
        registry
    }

    fn selected(registry: &Registry, pattern: &str) -> Vec<String> {
        registry
            .select(pattern)
            .unwrap()
            .into_iter()
            .map(|t| t.name.clone())
            .collect()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(Test::new("etcd.Discovery", noop).cluster_size(3))
            .unwrap();

        let err = registry
            .register(Test::new("etcd.Discovery", noop))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "etcd.Discovery"));

        // The first registration survives.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("etcd.Discovery").unwrap().cluster_size, 3);
    }

    #[test]
    fn select_matches_glob_in_name_order() {
        let registry = registry(&["etcd.B", "etcd.A", "coretest.C"]);
        assert_eq!(selected(&registry, "etcd.*"), vec!["etcd.A", "etcd.B"]);
        assert_eq!(selected(&registry, "*"), vec!["coretest.C", "etcd.A", "etcd.B"]);
        assert_eq!(selected(&registry, "etcd.?"), vec!["etcd.A", "etcd.B"]);
        assert_eq!(selected(&registry, "etcd.[A]"), vec!["etcd.A"]);
        assert!(selected(&registry, "nomatch").is_empty());
    }

    #[test]
    fn star_does_not_cross_separator() {
        let registry = registry(&["group/a", "group/sub/b"]);
        assert_eq!(selected(&registry, "group/*"), vec!["group/a"]);
        assert_eq!(selected(&registry, "*"), Vec::<String>::new());
    }

    #[test]
    fn malformed_pattern_is_an_error() {
        let registry = registry(&["etcd.A"]);
        assert!(registry.select("etcd.[").is_err());
    }

    #[test]
    fn braces_are_literal() {
        let registry = registry(&["etcd.A", "etcd.B", "x{y", "z{a,b}"]);
        assert!(selected(&registry, "etcd.{A,B}").is_empty());
        assert_eq!(selected(&registry, "x{y"), vec!["x{y"]);
        assert_eq!(selected(&registry, "z{a,b}"), vec!["z{a,b}"]);
        assert_eq!(selected(&registry, "x[{]y"), vec!["x{y"]);
        assert_eq!(selected(&registry, "*}"), vec!["z{a,b}"]);
    }

    #[test]
    fn native_func_lookup() {
        let mut registry = Registry::new();
        registry
            .register(Test::new("coretest.NativeHello", noop).native_func("Hello", hello))
            .unwrap();

        assert!(registry.get("coretest.NativeHello").unwrap().has_native_funcs());
        assert!(registry.native_func("coretest.NativeHello", "Hello").is_some());
        assert!(registry.native_func("coretest.NativeHello", "Bye").is_none());
        assert!(registry.native_func("nope", "Hello").is_none());
    }

    #[test]
    fn builder_defaults() {
        let test = Test::new("x", noop);
        assert_eq!(test.cluster_size, 1);
        assert!(test.platforms.is_none());
        assert!(!test.has_native_funcs());

        let test = test.platforms(["qemu"]);
        assert_eq!(test.platforms, Some(vec!["qemu".to_string()]));
    }
}
