//! The volume directory: a reserved B+-tree mapping tree names to root
//! page ids.
//!
//! The directory tree's root lives in the volume header and, like every
//! tree root here, never moves. Directory entries are plain 8-byte page
//! ids - metadata is not versioned.

use log::info;

use crate::common::{Error, PageId, Result};
use crate::encoding::Key;
use crate::journal::{JournalManager, TreeMetaOp};
use crate::page::PageType;

use super::btree::TreeOps;

/// Reserved name of the directory tree itself.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// Whether a tree name is usable by callers.
pub fn valid_tree_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('_') && name.len() <= 255
}

fn name_key(name: &str) -> Key {
    let mut key = Key::new();
    key.append_str(name);
    key
}

/// Look up a tree's root page id. `ops` must be over the directory tree.
pub fn lookup_tree(ops: &TreeOps<'_>, name: &str) -> Result<Option<PageId>> {
    match ops.fetch(name_key(name).encoded())? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::CorruptVolume(
                    ops.volume.name().to_string(),
                    format!("directory entry for {:?} is malformed", name),
                )
            })?;
            Ok(Some(PageId::new(u64::from_le_bytes(arr))))
        }
        None => Ok(None),
    }
}

/// Create a tree: allocate an empty root leaf, record it in the
/// directory, journal the creation.
pub fn create_tree(ops: &TreeOps<'_>, journal: &JournalManager, name: &str) -> Result<PageId> {
    let ts = ops.timestamps.allocate();
    let root = {
        let guard = ops
            .pool
            .get_for_new(ops.volume, PageType::Data, 0, ts)?;
        guard.page_id()
    };
    ops.store(name_key(name).encoded(), &root.0.to_le_bytes(), ts)?;
    journal.write_tree_meta(TreeMetaOp::Create, ops.volume.id(), name, root, ts)?;
    info!("created tree {:?} with root {}", name, root);
    Ok(root)
}

/// Drop a tree: remove its directory entry and free every page of the
/// tree, the root included.
///
/// `dir_ops` must be over the directory tree and `tree_ops` over the tree
/// being dropped. The caller is responsible for discarding any cached
/// handle to the dropped tree.
pub fn drop_tree(
    dir_ops: &TreeOps<'_>,
    tree_ops: &TreeOps<'_>,
    journal: &JournalManager,
    name: &str,
) -> Result<()> {
    let ts = dir_ops.timestamps.allocate();
    let root = tree_ops.tree.root();

    if !dir_ops.remove(name_key(name).encoded(), ts)? {
        return Err(Error::TreeNotFound(name.to_string()));
    }

    // Collect the whole tree: index pages by depth-first descent, leaves
    // by their sibling chain.
    let pages = collect_tree_pages(tree_ops)?;
    for page_id in pages {
        tree_ops.volume.free_page(dir_ops.pool, page_id, ts)?;
    }

    journal.write_tree_meta(TreeMetaOp::Drop, dir_ops.volume.id(), name, root, ts)?;
    info!("dropped tree {:?} (root {})", name, root);
    Ok(())
}

fn collect_tree_pages(ops: &TreeOps<'_>) -> Result<Vec<PageId>> {
    let volume_id = ops.tree.volume_id();
    let mut pages = Vec::new();
    let mut stack = vec![ops.tree.root()];
    while let Some(page_id) = stack.pop() {
        pages.push(page_id);
        let guard = ops.pool.get_shared(volume_id, page_id)?;
        if guard.page_type() == PageType::Index {
            for i in 0..guard.key_block_count() {
                stack.push(guard.child_at(i));
            }
        }
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tree_name() {
        assert!(valid_tree_name("orders"));
        assert!(valid_tree_name("a"));
        assert!(!valid_tree_name(""));
        assert!(!valid_tree_name("_directory"));
        assert!(!valid_tree_name("_anything"));
        assert!(!valid_tree_name(&"x".repeat(256)));
    }
}
