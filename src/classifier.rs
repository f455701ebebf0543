//! Pure change classifier / side selector (spec.md S4.4).
//!
//! `classify` never touches I/O; it maps `(doc, prev)` to a `Decision`
//! which `engine::apply_decision` then executes against a `Side`.

use crate::metadata::{extract_rev, DocType, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideName {
    Local,
    Remote,
}

impl SideName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideName::Local => "local",
            SideName::Remote => "remote",
        }
    }
}

/// The action decision produced by the classifier (Design Notes S9).
#[derive(Debug)]
pub enum Decision {
    AddFile,
    AddFolder,
    Overwrite,
    UpdateMeta,
    UpdateFolder,
    MoveFile,
    MoveFolder,
    Trash,
    DeleteFolder,
    AssignRev,
    /// Up to date, or suppressed by an ignore predicate, or a source-side
    /// shadow of an in-flight move: advance the cursor, do nothing else.
    NoOp,
    /// Local side carries a blocking incompatibility that predates this
    /// change: warn, skip, and (if the record used to be compatible) also
    /// trash the stale local copy.
    SkipIncompatible { was_compatible_before: bool },
    /// `docType` is neither `file` nor `folder`.
    FatalClassification,
}

/// Picks the applying side by comparing `sides.local` vs `sides.remote`
/// (spec.md S4.4 step 2). `None` means both sides already agree.
pub fn select_side(doc: &Metadata) -> Option<(SideName, i64)> {
    if doc.sides.local > doc.sides.remote {
        Some((SideName::Remote, doc.sides.remote))
    } else if doc.sides.remote > doc.sides.local {
        Some((SideName::Local, doc.sides.local))
    } else {
        None
    }
}

/// True only for the catch-all branch of `classify` (file/folder update vs.
/// overwrite), the one case that needs `getPreviousRev` from the store.
/// Mirrors `classify`'s own early returns so the caller never fetches a
/// revision classify wouldn't have used anyway.
pub fn needs_previous_rev(doc: &Metadata) -> bool {
    if !doc.incompatibilities.is_empty() && doc.move_from.is_none() {
        return false;
    }
    if doc.deleted && extract_rev(&doc.rev) == 0 {
        return false;
    }
    if doc.move_to.is_some() {
        return false;
    }
    if doc.move_from.is_some() {
        return false;
    }
    if doc.deleted {
        return false;
    }
    if extract_rev(&doc.rev) == 0 {
        return false;
    }
    true
}

/// Step 4 of spec.md S4.4: the decision table, first match wins. `prev` is
/// the result of `getPreviousRev(id, rev)` — `None` when missing or not yet
/// fetched by the caller (the `rev == 0` and move branches never need it).
pub fn classify(doc: &Metadata, prev: Option<&Metadata>) -> Decision {
    if !doc.incompatibilities.is_empty() && doc.move_from.is_none() {
        let was_compatible_before = prev.map(|p| p.incompatibilities.is_empty()).unwrap_or(false);
        return Decision::SkipIncompatible { was_compatible_before };
    }

    if doc.deleted && extract_rev(&doc.rev) == 0 {
        return Decision::NoOp;
    }

    if doc.move_to.is_some() {
        return Decision::NoOp;
    }

    if let Some(from) = &doc.move_from {
        if !from.incompatibilities.is_empty() {
            return match doc.doc_type {
                DocType::File => Decision::AddFile,
                DocType::Folder => Decision::AddFolder,
            };
        }
        if from.child_move {
            return Decision::AssignRev;
        }
        return match doc.doc_type {
            DocType::File => Decision::MoveFile,
            DocType::Folder => Decision::MoveFolder,
        };
    }

    if doc.deleted {
        return match doc.doc_type {
            DocType::File => Decision::Trash,
            DocType::Folder => Decision::DeleteFolder,
        };
    }

    if extract_rev(&doc.rev) == 0 {
        return match doc.doc_type {
            DocType::File => Decision::AddFile,
            DocType::Folder => Decision::AddFolder,
        };
    }

    match prev {
        None => match doc.doc_type {
            DocType::File => Decision::Overwrite,
            DocType::Folder => Decision::AddFolder,
        },
        Some(prev) => match doc.doc_type {
            DocType::Folder => Decision::UpdateFolder,
            DocType::File if prev.md5sum == doc.md5sum => Decision::UpdateMeta,
            DocType::File => Decision::Overwrite,
        },
    }
}
