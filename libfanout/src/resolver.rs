//! Reply and quote dependency resolution
//!
//! Replies form a hard dependency: a reply cannot be posted to a
//! target until its parent (or at least the thread root) has a remote
//! id there. Quotes are advisory; an unresolvable quote degrades to a
//! reference link or is dropped, never blocking the post.

use crate::error::Result;
use crate::ledger::Ledger;
use crate::types::SourceItem;

/// Whether an item can be dispatched to a target right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Postable; for replies, the remote id to thread under.
    Postable { reply_to: Option<String> },
    /// Reply whose parent has no remote id on this target yet.
    NotReady,
}

/// Resolve reply dependencies for `item` on `target`.
///
/// Prefers the direct parent's remote id; falls back to the thread
/// root so a reply still lands in the right thread when only the root
/// made it across.
pub async fn resolve(ledger: &Ledger, item: &SourceItem, target: &str) -> Result<Resolution> {
    let Some(reply) = &item.reply else {
        return Ok(Resolution::Postable { reply_to: None });
    };

    let parent = ledger.get_remote_id(&reply.parent_id, target).await?;
    if let Some(parent_id) = parent {
        return Ok(Resolution::Postable {
            reply_to: Some(parent_id),
        });
    }

    if reply.root_id != reply.parent_id {
        if let Some(root_id) = ledger.get_remote_id(&reply.root_id, target).await? {
            return Ok(Resolution::Postable {
                reply_to: Some(root_id),
            });
        }
    }

    Ok(Resolution::NotReady)
}

/// Compose the outgoing text for `item` on `target`, folding in the
/// quote when present.
///
/// A self-quote whose quoted item is already published on this target
/// gets the quoted text inlined as a quote block. Otherwise the
/// quote's canonical source url is appended as a plain reference
/// link. A quote with no resolvable reference at all is dropped from
/// the text.
pub async fn compose_text(ledger: &Ledger, item: &SourceItem, target: &str) -> Result<String> {
    let Some(quote) = &item.quote else {
        return Ok(item.text.clone());
    };

    if quote.is_self_quote && ledger.get_remote_id(&quote.id, target).await?.is_some() {
        return Ok(format!("{}\n\n> {}", item.text, quote.text));
    }

    match &quote.url {
        Some(url) => Ok(append_link(&item.text, url)),
        None => Ok(item.text.clone()),
    }
}

fn append_link(text: &str, url: &str) -> String {
    if text.is_empty() {
        url.to_string()
    } else {
        format!("{text}\n\n{url}")
    }
}
