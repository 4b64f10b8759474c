//! Ordered multi-tree walk with D/F-conflict detection.
//!
//! Generalizes the pairwise old/new tree comparison that diffing needs to an
//! arbitrary number of trees walked in lockstep, sorted by git's tree entry
//! order. Used both by pack object enumeration (comparing a commit's tree
//! against the trees of objects the receiver already has) and by diff.
//!
//! A row pairs one path with one entry slot per input tree; a slot is `None`
//! when that tree doesn't have the path. A "D/F conflict" -- the same path
//! is a directory in one tree and a file in another -- is surfaced as two
//! separate rows (the file row at this path, and the directory's contents
//! recursed into under this path), matching how c git's tree-diff machinery
//! treats the case.

use bstr::BString;
use git_hash::ObjectId;
use git_object::{Object, Tree, TreeEntry};

use crate::{ObjectDatabase, OdbError};

/// One path's entry across every tree being walked, in input order.
/// `None` means that tree has no entry at this path.
#[derive(Debug, Clone)]
pub struct TreeWalkRow {
    pub path: BString,
    pub entries: Vec<Option<TreeEntry>>,
}

/// Walk `trees` (each `None` standing in for the empty tree) in lockstep,
/// depth-first, yielding one row per distinct path.
///
/// Rows where every tree agrees (same mode and oid) are still emitted --
/// callers that want only differences should filter those out themselves,
/// since pack enumeration needs the full reachable set while diff wants only
/// changes.
pub fn walk_trees(
    odb: &ObjectDatabase,
    trees: &[Option<ObjectId>],
) -> Result<Vec<TreeWalkRow>, OdbError> {
    let roots: Vec<Tree> = trees
        .iter()
        .map(|oid| match oid {
            Some(oid) => read_tree(odb, oid),
            None => Ok(Tree { entries: Vec::new() }),
        })
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::new();
    let prefix = BString::from("");
    let entry_slices: Vec<&[TreeEntry]> = roots.iter().map(|t| t.entries.as_slice()).collect();
    walk_level(odb, &entry_slices, &prefix, &mut rows)?;
    Ok(rows)
}

fn read_tree(odb: &ObjectDatabase, oid: &ObjectId) -> Result<Tree, OdbError> {
    let obj = odb.read(oid)?.ok_or(OdbError::NotFound(*oid))?;
    match obj {
        Object::Tree(tree) => Ok(tree),
        other => Err(OdbError::UnexpectedType {
            oid: *oid,
            expected: "tree",
            actual: other.object_type().to_string(),
        }),
    }
}

fn full_path(prefix: &BString, name: &[u8]) -> BString {
    if prefix.is_empty() {
        BString::from(name)
    } else {
        let mut p = prefix.clone();
        p.push(b'/');
        p.extend_from_slice(name);
        p
    }
}

/// K-way merge of one tree level, keyed by git's tree entry ordering.
fn walk_level(
    odb: &ObjectDatabase,
    levels: &[&[TreeEntry]],
    prefix: &BString,
    rows: &mut Vec<TreeWalkRow>,
) -> Result<(), OdbError> {
    let mut cursors = vec![0usize; levels.len()];

    loop {
        // Find the lexicographically-least current entry across all trees.
        let min_entry = cursors
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| levels[i].get(c))
            .min()
            .cloned();

        let Some(min_entry) = min_entry else { break };

        let mut slots: Vec<Option<TreeEntry>> = vec![None; levels.len()];
        let mut any_tree = false;

        for (i, &c) in cursors.clone().iter().enumerate() {
            if let Some(entry) = levels[i].get(c) {
                if TreeEntry::cmp_entries(entry, &min_entry) == std::cmp::Ordering::Equal
                    && entry.name == min_entry.name
                {
                    slots[i] = Some(entry.clone());
                    cursors[i] += 1;
                    any_tree |= entry.mode.is_tree();
                }
            }
        }

        let path = full_path(prefix, min_entry.name.as_ref());
        rows.push(TreeWalkRow {
            path: path.clone(),
            entries: slots.clone(),
        });

        if any_tree {
            // Recurse into every tree-typed slot at this path (D/F conflicts
            // mean not every slot is itself a tree; non-tree slots simply
            // contribute no children at the next level).
            let child_trees: Vec<Tree> = slots
                .iter()
                .map(|slot| match slot {
                    Some(e) if e.mode.is_tree() => read_tree(odb, &e.oid),
                    _ => Ok(Tree { entries: Vec::new() }),
                })
                .collect::<Result<_, _>>()?;
            let child_slices: Vec<&[TreeEntry]> =
                child_trees.iter().map(|t| t.entries.as_slice()).collect();
            walk_level(odb, &child_slices, &path, rows)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_object::FileMode;

    fn write_tree(odb: &ObjectDatabase, entries: Vec<TreeEntry>) -> ObjectId {
        odb.write(&Object::Tree(Tree { entries })).unwrap()
    }

    fn write_blob(odb: &ObjectDatabase, content: &[u8]) -> ObjectId {
        odb.write(&Object::Blob(git_object::Blob {
            data: content.to_vec().into(),
        }))
        .unwrap()
    }

    fn entry(name: &str, mode: FileMode, oid: ObjectId) -> TreeEntry {
        TreeEntry {
            mode,
            name: BString::from(name),
            oid,
        }
    }

    #[test]
    fn three_way_walk_flags_absence_per_tree() {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDatabase::open(dir.path().join("objects")).unwrap();

        let blob_a = write_blob(&odb, b"a");
        let blob_b = write_blob(&odb, b"b");

        // tree1: {foo: a}
        let t1 = write_tree(&odb, vec![entry("foo", FileMode::Regular, blob_a)]);
        // tree2: {foo: b, bar: a}
        let t2 = write_tree(
            &odb,
            vec![
                entry("bar", FileMode::Regular, blob_a),
                entry("foo", FileMode::Regular, blob_b),
            ],
        );

        let rows = walk_trees(&odb, &[Some(t1), Some(t2), None]).unwrap();
        assert_eq!(rows.len(), 2);

        let bar_row = rows.iter().find(|r| r.path == "bar").unwrap();
        assert!(bar_row.entries[0].is_none());
        assert!(bar_row.entries[1].is_some());
        assert!(bar_row.entries[2].is_none());

        let foo_row = rows.iter().find(|r| r.path == "foo").unwrap();
        assert_eq!(foo_row.entries[0].as_ref().unwrap().oid, blob_a);
        assert_eq!(foo_row.entries[1].as_ref().unwrap().oid, blob_b);
        assert!(foo_row.entries[2].is_none());
    }

    #[test]
    fn recurses_into_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDatabase::open(dir.path().join("objects")).unwrap();

        let blob = write_blob(&odb, b"nested");
        let inner = write_tree(&odb, vec![entry("baz.txt", FileMode::Regular, blob)]);
        let outer = write_tree(&odb, vec![entry("sub", FileMode::Tree, inner)]);

        let rows = walk_trees(&odb, &[Some(outer)]).unwrap();
        let paths: Vec<String> = rows.iter().map(|r| r.path.to_string()).collect();
        assert!(paths.contains(&"sub".to_string()));
        assert!(paths.contains(&"sub/baz.txt".to_string()));
    }

    #[test]
    fn df_conflict_surfaces_as_separate_file_and_directory_rows() {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDatabase::open(dir.path().join("objects")).unwrap();

        let blob = write_blob(&odb, b"file-version");
        let nested_blob = write_blob(&odb, b"dir-version");
        let inner = write_tree(&odb, vec![entry("x", FileMode::Regular, nested_blob)]);

        // tree1 has "thing" as a file; tree2 has "thing" as a directory.
        // Git's tree entry order sorts a file before a same-named directory
        // ("thing\0" < "thing/"), so these never land in the same row --
        // each tree's "thing" entry gets its own row.
        let t1 = write_tree(&odb, vec![entry("thing", FileMode::Regular, blob)]);
        let t2 = write_tree(&odb, vec![entry("thing", FileMode::Tree, inner)]);

        let rows: Vec<_> = walk_trees(&odb, &[Some(t1), Some(t2)])
            .unwrap()
            .into_iter()
            .filter(|r| r.path == "thing")
            .collect();
        assert_eq!(rows.len(), 2);

        let file_row = rows
            .iter()
            .find(|r| r.entries[0].is_some())
            .expect("file-side row");
        assert_eq!(file_row.entries[0].as_ref().unwrap().mode, FileMode::Regular);
        assert!(file_row.entries[1].is_none());

        let dir_row = rows
            .iter()
            .find(|r| r.entries[1].is_some())
            .expect("directory-side row");
        assert!(dir_row.entries[0].is_none());
        assert_eq!(dir_row.entries[1].as_ref().unwrap().mode, FileMode::Tree);

        // The directory side's contents are still recursed into.
        assert!(rows_contains_path(&odb, &t1, &t2, "thing/x"));
    }

    fn rows_contains_path(odb: &ObjectDatabase, t1: &ObjectId, t2: &ObjectId, path: &str) -> bool {
        walk_trees(odb, &[Some(*t1), Some(*t2)])
            .unwrap()
            .iter()
            .any(|r| r.path == path)
    }
}
