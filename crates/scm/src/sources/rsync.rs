//! Rsync source engine: the copy step straight from the declared origin.

use anyhow::{Context, Result};

use crate::sources::engine::SourceEngine;

pub(crate) async fn refresh(engine: &SourceEngine) -> Result<()> {
    let source = engine
        .declaration()
        .and_then(|declaration| declaration.source.as_deref())
        .context("rsync refresh without a source")?;
    engine.copy(source, &[]).await
}
