//! Tree editing without a working directory

use git2::{FileMode, ObjectType, Oid, Repository, Tree};

/// Set (`Some`) or remove (`None`) the blob at `path`, returning the new root tree
///
/// Directories emptied by a removal disappear, as they would in a checkout.
pub(crate) fn write_path(
    repo: &Repository,
    root: Option<&Tree<'_>>,
    path: &str,
    blob: Option<Oid>,
) -> Result<Oid, git2::Error> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Err(git2::Error::from_str("empty path"));
    }
    match edit(repo, root, &components, blob)? {
        Some(oid) => Ok(oid),
        None => repo.treebuilder(None)?.write(),
    }
}

fn edit(
    repo: &Repository,
    tree: Option<&Tree<'_>>,
    components: &[&str],
    blob: Option<Oid>,
) -> Result<Option<Oid>, git2::Error> {
    let Some((head, rest)) = components.split_first() else {
        return Ok(tree.map(|t| t.id()));
    };
    let mut builder = repo.treebuilder(tree)?;
    let existing = builder.get(*head)?.map(|e| (e.id(), e.kind()));

    let replacement = if rest.is_empty() {
        blob.map(|oid| (oid, FileMode::Blob))
    } else {
        let subtree = match existing {
            Some((id, Some(ObjectType::Tree))) => Some(repo.find_tree(id)?),
            _ => None,
        };
        edit(repo, subtree.as_ref(), rest, blob)?.map(|oid| (oid, FileMode::Tree))
    };

    match replacement {
        Some((oid, mode)) => {
            builder.insert(*head, oid, i32::from(mode))?;
        }
        None if existing.is_some() => {
            builder.remove(*head)?;
        }
        None => {}
    }

    if builder.len() == 0 {
        return Ok(None);
    }
    builder.write().map(Some)
}

/// Content of the blob at `path`, if any
#[cfg(test)]
pub(crate) fn read_path(
    repo: &Repository,
    root: &Tree<'_>,
    path: &str,
) -> Result<Option<Vec<u8>>, git2::Error> {
    let entry = match root.get_path(std::path::Path::new(path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        return Ok(None);
    }
    Ok(Some(repo.find_blob(entry.id())?.content().to_vec()))
}
