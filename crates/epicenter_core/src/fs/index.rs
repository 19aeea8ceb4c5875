//! In-memory derivation of the active `files` table shape.
//!
//! Two maps — `pathToId` and `childrenOf` — are kept as an exact derivation
//! of the non-trashed rows. The index is rebuilt from the table at startup
//! (with orphan fix-up) and updated incrementally from table change events.
//!
//! Sibling name collisions (possible after concurrent remote creates, even
//! though local writes enforce uniqueness) resolve deterministically: the
//! sibling with the smallest file id keeps the plain name, every other
//! sibling gets `stem~<first 8 of id><extension>`. Both spellings resolve
//! through the path map, so colliding files stay reachable on every replica.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::FileRow;
use super::path;

/// Deterministic display name for a collision loser.
fn disambiguate(name: &str, id: &str) -> String {
    let tag: String = id.chars().take(8).collect();
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}~{}{}", &name[..idx], tag, &name[idx..]),
        _ => format!("{}~{}", name, tag),
    }
}

/// Path and children maps over the active portion of the files table.
pub(crate) struct FsIndex {
    rows: HashMap<String, FileRow>,
    path_to_id: HashMap<String, String>,
    id_to_path: HashMap<String, String>,
    /// Children by declared parent id (`None` = root), ordered by id.
    children: HashMap<Option<String>, BTreeSet<String>>,
}

impl FsIndex {
    /// Build the index from a snapshot of table rows. Trashed rows are
    /// skipped; rows whose parent no longer exists are re-parented to root.
    pub fn build(rows: Vec<FileRow>) -> Self {
        let mut index = Self {
            rows: HashMap::new(),
            path_to_id: HashMap::new(),
            id_to_path: HashMap::new(),
            children: HashMap::new(),
        };

        let active_ids: HashSet<String> = rows
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.id.clone())
            .collect();

        for mut row in rows.into_iter().filter(|r| r.is_active()) {
            if let Some(parent) = &row.parent_id
                && !active_ids.contains(parent)
            {
                log::warn!(
                    "fs index: re-parenting orphan '{}' (missing parent '{}') to root",
                    row.id,
                    parent
                );
                row.parent_id = None;
            }
            index
                .children
                .entry(row.parent_id.clone())
                .or_default()
                .insert(row.id.clone());
            index.rows.insert(row.id.clone(), row);
        }

        index.assign_paths(None);
        index
    }

    /// Apply one table change: `row` is the new active row, or `None` when
    /// the row was deleted or trashed.
    pub fn apply_change(&mut self, id: &str, row: Option<FileRow>) {
        let old_parent = self.rows.get(id).map(|r| r.parent_id.clone());

        // Paths under the node are reassigned from the affected parents.
        self.drop_subtree_paths(id);
        if let Some(prev_parent) = &old_parent
            && let Some(siblings) = self.children.get_mut(prev_parent)
        {
            siblings.remove(id);
            if siblings.is_empty() {
                self.children.remove(prev_parent);
            }
        }
        self.rows.remove(id);

        let mut new_parent: Option<Option<String>> = None;
        if let Some(row) = row {
            let parent_key = row.parent_id.clone();
            self.children
                .entry(parent_key.clone())
                .or_default()
                .insert(id.to_string());
            self.rows.insert(id.to_string(), row);
            new_parent = Some(parent_key);
        }

        if let Some(prev) = &old_parent {
            self.assign_paths(prev.as_deref());
        }
        if let Some(next) = new_parent
            && old_parent.as_ref() != Some(&next)
        {
            self.assign_paths(next.as_deref());
        }
    }

    /// Remove path mappings for a node and all its descendants.
    fn drop_subtree_paths(&mut self, root: &str) {
        let mut stack = vec![root.to_string()];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(old) = self.id_to_path.remove(&id)
                && self.path_to_id.get(&old).is_some_and(|owner| *owner == id)
            {
                self.path_to_id.remove(&old);
            }
            if let Some(kids) = self.children.get(&Some(id)) {
                stack.extend(kids.iter().cloned());
            }
        }
    }

    /// Assign display names and paths for every child of `parent`, then
    /// recurse into folders. Parents without a path (not yet synced) are
    /// skipped; their subtree resolves once they arrive.
    fn assign_paths(&mut self, parent: Option<&str>) {
        let parent_path = match parent {
            None => "/".to_string(),
            Some(id) => match self.id_to_path.get(id) {
                Some(p) => p.clone(),
                None => return,
            },
        };
        let key = parent.map(String::from);
        let kids: Vec<String> = self
            .children
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        // Ascending-id iteration makes the first holder of each name the
        // deterministic winner of the plain spelling.
        let mut plain_owner: HashMap<String, String> = HashMap::new();
        for id in &kids {
            if let Some(row) = self.rows.get(id) {
                plain_owner
                    .entry(row.name.clone())
                    .or_insert_with(|| id.clone());
            }
        }

        let mut folders: Vec<String> = Vec::new();
        let mut stale: Vec<(String, String)> = Vec::new();
        for id in &kids {
            let Some(row) = self.rows.get(id) else {
                continue;
            };
            let display = if plain_owner.get(&row.name) == Some(id) {
                row.name.clone()
            } else {
                disambiguate(&row.name, id)
            };
            let new_path = path::join(&parent_path, &display);
            if let Some(old) = self.id_to_path.insert(id.clone(), new_path.clone())
                && old != new_path
            {
                stale.push((id.clone(), old));
            }
            self.path_to_id.insert(new_path, id.clone());
            if row.is_folder() {
                folders.push(id.clone());
            }
        }
        for (id, old) in stale {
            if self.path_to_id.get(&old).is_some_and(|owner| *owner == id) {
                self.path_to_id.remove(&old);
            }
        }

        for id in folders {
            self.assign_paths(Some(&id));
        }
    }

    /// The active row at a path, if any.
    pub fn lookup(&self, p: &str) -> Option<&FileRow> {
        self.path_to_id.get(p).and_then(|id| self.rows.get(id))
    }

    /// The id at a path.
    pub fn id_at(&self, p: &str) -> Option<&String> {
        self.path_to_id.get(p)
    }

    /// The path of an id.
    pub fn path_of(&self, id: &str) -> Option<&String> {
        self.id_to_path.get(id)
    }

    /// The active row for an id.
    pub fn row(&self, id: &str) -> Option<&FileRow> {
        self.rows.get(id)
    }

    /// Ids of a parent's children (ascending by id).
    pub fn children_ids(&self, parent: Option<&str>) -> Vec<String> {
        self.children
            .get(&parent.map(String::from))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(display name, id)` pairs for a parent's children, sorted by name.
    pub fn display_entries(&self, parent: Option<&str>) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .children_ids(parent)
            .into_iter()
            .filter_map(|id| {
                self.id_to_path
                    .get(&id)
                    .map(|p| (path::basename(p).to_string(), id))
            })
            .collect();
        entries.sort();
        entries
    }

    /// Number of active rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// All indexed paths, sorted (test support).
    #[cfg(test)]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.path_to_id.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl std::fmt::Debug for FsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsIndex")
            .field("rows", &self.rows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::FileKind;
    use super::*;

    fn row(id: &str, name: &str, parent: Option<&str>, kind: FileKind) -> FileRow {
        FileRow {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: parent.map(String::from),
            kind,
            size: 0,
            created_at: 1,
            updated_at: 1,
            trashed_at: None,
        }
    }

    #[test]
    fn test_build_assigns_paths() {
        let index = FsIndex::build(vec![
            row("d1", "docs", None, FileKind::Folder),
            row("f1", "a.txt", Some("d1"), FileKind::File),
            row("f2", "b.txt", None, FileKind::File),
        ]);

        assert_eq!(index.path_of("d1"), Some(&"/docs".to_string()));
        assert_eq!(index.path_of("f1"), Some(&"/docs/a.txt".to_string()));
        assert_eq!(index.path_of("f2"), Some(&"/b.txt".to_string()));
        assert_eq!(index.lookup("/docs/a.txt").unwrap().id, "f1");
    }

    #[test]
    fn test_trashed_rows_are_excluded() {
        let mut trashed = row("f1", "gone.txt", None, FileKind::File);
        trashed.trashed_at = Some(99);
        let index = FsIndex::build(vec![trashed, row("f2", "kept.txt", None, FileKind::File)]);

        assert_eq!(index.len(), 1);
        assert!(index.lookup("/gone.txt").is_none());
        assert!(index.lookup("/kept.txt").is_some());
    }

    #[test]
    fn test_orphans_reparent_to_root_on_build() {
        let index = FsIndex::build(vec![row("f1", "lost.txt", Some("missing"), FileKind::File)]);
        assert_eq!(index.path_of("f1"), Some(&"/lost.txt".to_string()));
        assert_eq!(index.children_ids(None), vec!["f1".to_string()]);
    }

    #[test]
    fn test_sibling_collision_disambiguation() {
        let index = FsIndex::build(vec![
            row("aaaa1111", "note.md", None, FileKind::File),
            row("bbbb2222", "note.md", None, FileKind::File),
        ]);

        // Smallest id keeps the plain name; the loser gets a derived suffix.
        assert_eq!(index.path_of("aaaa1111"), Some(&"/note.md".to_string()));
        assert_eq!(
            index.path_of("bbbb2222"),
            Some(&"/note~bbbb2222.md".to_string())
        );
        // Both spellings resolve.
        assert_eq!(index.id_at("/note.md"), Some(&"aaaa1111".to_string()));
        assert_eq!(
            index.id_at("/note~bbbb2222.md"),
            Some(&"bbbb2222".to_string())
        );

        let names: Vec<String> = index
            .display_entries(None)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["note.md", "note~bbbb2222.md"]);
    }

    #[test]
    fn test_incremental_add_and_remove() {
        let mut index = FsIndex::build(vec![row("d1", "docs", None, FileKind::Folder)]);

        index.apply_change("f1", Some(row("f1", "a.txt", Some("d1"), FileKind::File)));
        assert_eq!(index.path_of("f1"), Some(&"/docs/a.txt".to_string()));

        index.apply_change("f1", None);
        assert!(index.path_of("f1").is_none());
        assert!(index.lookup("/docs/a.txt").is_none());
    }

    #[test]
    fn test_incremental_rename_updates_subtree() {
        let mut index = FsIndex::build(vec![
            row("d1", "docs", None, FileKind::Folder),
            row("f1", "a.txt", Some("d1"), FileKind::File),
        ]);

        index.apply_change("d1", Some(row("d1", "papers", None, FileKind::Folder)));

        assert_eq!(index.path_of("d1"), Some(&"/papers".to_string()));
        assert_eq!(index.path_of("f1"), Some(&"/papers/a.txt".to_string()));
        assert!(index.lookup("/docs").is_none());
        assert!(index.lookup("/docs/a.txt").is_none());
    }

    #[test]
    fn test_incremental_move_across_parents() {
        let mut index = FsIndex::build(vec![
            row("d1", "a", None, FileKind::Folder),
            row("d2", "b", None, FileKind::Folder),
            row("f1", "x.txt", Some("d1"), FileKind::File),
        ]);

        index.apply_change("f1", Some(row("f1", "x.txt", Some("d2"), FileKind::File)));

        assert_eq!(index.path_of("f1"), Some(&"/b/x.txt".to_string()));
        assert!(index.lookup("/a/x.txt").is_none());
        assert!(index.children_ids(Some("d1")).is_empty());
        assert_eq!(index.children_ids(Some("d2")), vec!["f1".to_string()]);
    }

    #[test]
    fn test_child_arriving_before_parent_resolves_later() {
        let mut index = FsIndex::build(vec![]);

        // Remote order: the file lands before its folder.
        index.apply_change("f1", Some(row("f1", "x.txt", Some("d1"), FileKind::File)));
        assert!(index.path_of("f1").is_none());

        index.apply_change("d1", Some(row("d1", "docs", None, FileKind::Folder)));
        assert_eq!(index.path_of("f1"), Some(&"/docs/x.txt".to_string()));
    }

    #[test]
    fn test_paths_exactly_mirror_active_rows() {
        let mut index = FsIndex::build(vec![
            row("d1", "docs", None, FileKind::Folder),
            row("f1", "a.txt", Some("d1"), FileKind::File),
        ]);
        assert_eq!(index.paths(), vec!["/docs".to_string(), "/docs/a.txt".to_string()]);

        index.apply_change("f1", None);
        assert_eq!(index.paths(), vec!["/docs".to_string()]);
    }

    #[test]
    fn test_disambiguate_suffix_shapes() {
        assert_eq!(disambiguate("a.txt", "12345678abc"), "a~12345678.txt");
        assert_eq!(disambiguate("noext", "12345678abc"), "noext~12345678");
        assert_eq!(disambiguate(".hidden", "12345678abc"), ".hidden~12345678");
    }
}
