//! Ordered, destination-keyed mount collection.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use oci_spec::runtime::Mount;

/// Lexically clean a path: collapse separators, drop `.`, resolve `..`.
///
/// `..` never climbs above the root of an absolute path.
#[must_use]
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Number of named components in the cleaned destination; `/` is 0 and
/// deeper mounts sort later.
#[must_use]
pub fn depth(path: &Path) -> usize {
    clean_path(path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Whether `path` lies strictly below `dir` (both cleaned).
#[must_use]
pub fn is_below(path: &Path, dir: &Path) -> bool {
    path != dir && path.starts_with(dir)
}

/// Mounts keyed by cleaned destination. Adding a mount whose destination is
/// already present replaces the earlier one in place.
#[derive(Debug, Clone, Default)]
pub struct MountSet {
    mounts: Vec<Mount>,
    index: HashMap<PathBuf, usize>,
}

impl MountSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `mount`, replacing any mount at the same cleaned destination.
    pub fn add(&mut self, mount: Mount) {
        let key = clean_path(mount.destination());
        if let Some(&i) = self.index.get(&key) {
            self.mounts[i] = mount;
        } else {
            self.index.insert(key, self.mounts.len());
            self.mounts.push(mount);
        }
    }

    /// Whether a mount targets `destination`.
    #[must_use]
    pub fn contains(&self, destination: &Path) -> bool {
        self.index.contains_key(&clean_path(destination))
    }

    /// The mount at `destination`.
    #[must_use]
    pub fn get(&self, destination: &Path) -> Option<&Mount> {
        self.index
            .get(&clean_path(destination))
            .map(|&i| &self.mounts[i])
    }

    /// Number of mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Mounts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    /// Mutable access to every mount.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mount> {
        self.mounts.iter_mut()
    }

    /// Mounts sorted by destination depth; equal depths keep insertion order.
    #[must_use]
    pub fn into_sorted(self) -> Vec<Mount> {
        let mut mounts = self.mounts;
        sort_by_depth(&mut mounts, |m| m.destination().as_path());
        mounts
    }
}

impl Extend<Mount> for MountSet {
    fn extend<T: IntoIterator<Item = Mount>>(&mut self, iter: T) {
        for mount in iter {
            self.add(mount);
        }
    }
}

impl FromIterator<Mount> for MountSet {
    fn from_iter<T: IntoIterator<Item = Mount>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Stable sort by destination depth.
pub fn sort_by_depth<T>(items: &mut [T], destination: impl Fn(&T) -> &Path) {
    items.sort_by_key(|item| depth(destination(item)));
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bind(dest: &str, src: &str) -> Mount {
        corral_oci::mount(dest, "bind", src, &["rbind"]).unwrap()
    }

    #[test]
    fn clean() {
        assert_eq!(clean_path(Path::new("/a//b/./c/")), PathBuf::from("/a/b/c"));
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn depths() {
        assert_eq!(depth(Path::new("/")), 0);
        assert_eq!(depth(Path::new("/data")), 1);
        assert_eq!(depth(Path::new("/data/sub/")), 2);
        assert_eq!(depth(Path::new("/data/../")), 0);
        assert_eq!(depth(Path::new("/a/./b//c")), 3);
    }

    #[test]
    fn root_sorts_before_top_level() {
        let mut dests = ["/data", "/", "/data/sub", "/etc"].map(PathBuf::from).to_vec();
        sort_by_depth(&mut dests, PathBuf::as_path);
        assert_eq!(dests, ["/", "/data", "/etc", "/data/sub"].map(PathBuf::from).to_vec());
    }

    #[test]
    fn below() {
        assert!(is_below(Path::new("/dev/shm"), Path::new("/dev")));
        assert!(!is_below(Path::new("/dev"), Path::new("/dev")));
        assert!(!is_below(Path::new("/devices"), Path::new("/dev")));
    }

    #[test]
    fn last_write_wins_in_place() {
        let mut set = MountSet::new();
        set.add(bind("/a", "/1"));
        set.add(bind("/b", "/2"));
        set.add(bind("/a/", "/3"));
        assert_eq!(set.len(), 2);
        let first = set.iter().next().unwrap();
        assert_eq!(first.source().as_deref(), Some(Path::new("/3")));
        assert!(set.contains(Path::new("/a")));
    }

    #[test]
    fn sorted_is_stable() {
        let set: MountSet = [
            bind("/x/y", "1"),
            bind("/b", "2"),
            bind("/a", "3"),
            bind("/x/z", "4"),
        ]
        .into_iter()
        .collect();
        let dests: Vec<_> = set
            .into_sorted()
            .into_iter()
            .map(|m| m.destination().clone())
            .collect();
        assert_eq!(
            dests,
            ["/b", "/a", "/x/y", "/x/z"].map(PathBuf::from).to_vec()
        );
    }

    fn merge(mounts: Vec<Mount>) -> Vec<Mount> {
        mounts.into_iter().collect::<MountSet>().into_sorted()
    }

    fn summary(mounts: &[Mount]) -> Vec<(PathBuf, Option<PathBuf>)> {
        mounts
            .iter()
            .map(|m| (m.destination().clone(), m.source().clone()))
            .collect()
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(dests in proptest::collection::vec("(/[a-c]){1,4}", 0..12)) {
            let mounts: Vec<Mount> = dests
                .iter()
                .enumerate()
                .map(|(i, d)| bind(d, &i.to_string()))
                .collect();
            let once = merge(mounts);
            let twice = merge(once.clone());
            prop_assert_eq!(summary(&once), summary(&twice));
        }

        #[test]
        fn merge_has_unique_destinations(dests in proptest::collection::vec("(/[a-c]){1,4}", 0..12)) {
            let merged = merge(dests.iter().map(|d| bind(d, "s")).collect());
            let mut seen: Vec<_> = merged.iter().map(|m| clean_path(m.destination())).collect();
            let total = seen.len();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), total);
            prop_assert!(merged.windows(2).all(|w| depth(w[0].destination()) <= depth(w[1].destination())));
        }
    }
}
