//! Collective operations over a [`Context`].
//!
//! Every party of the mesh must call the same collectives in the same order;
//! each call draws a fresh key from the context so consecutive collectives
//! never see each other's payloads.

use bytes::Bytes;
use corelib::error::{Error, Result};
use corelib::Rank;
use futures::future::try_join_all;
use futures::try_join;

use crate::context::Context;

fn check_root(ctx: &Context, root: Rank) -> Result<()> {
    if root >= ctx.world_size() {
        return Err(Error::InvalidRank {
            rank: root,
            world_size: ctx.world_size(),
        });
    }
    Ok(())
}

/// Receives one payload under `key` from every peer, placing each at its
/// sender's rank. The local slot holds `own`.
async fn collect(ctx: &Context, key: &str, own: Bytes) -> Result<Vec<Bytes>> {
    let received = try_join_all(ctx.channels().map(|channel| async move {
        let payload = channel.recv(key).await?;
        Ok::<_, Error>((channel.peer_rank(), payload))
    }))
    .await?;

    let mut out = vec![Bytes::new(); ctx.world_size()];
    out[ctx.rank()] = own;
    for (rank, payload) in received {
        out[rank] = payload;
    }
    Ok(out)
}

/// Sends `input` from `root` to every other party. Every party returns the
/// root's payload. Only the root's `input` is used.
pub async fn broadcast(ctx: &Context, input: Option<Bytes>, root: Rank, tag: &str) -> Result<Bytes> {
    check_root(ctx, root)?;
    let key = ctx.next_collective_key(tag);
    if ctx.rank() != root {
        return ctx.recv(root, &key).await;
    }

    let payload =
        input.ok_or_else(|| Error::Config("the broadcast root must supply a payload".into()))?;
    let key = &key;
    try_join_all(
        ctx.channels()
            .map(|channel| channel.send(key, payload.clone())),
    )
    .await?;
    Ok(payload)
}

/// Collects every party's `input` at `root`, ordered by rank. Other parties
/// get an empty vector.
pub async fn gather(ctx: &Context, input: Bytes, root: Rank, tag: &str) -> Result<Vec<Bytes>> {
    check_root(ctx, root)?;
    let key = ctx.next_collective_key(tag);
    if ctx.rank() == root {
        collect(ctx, &key, input).await
    } else {
        ctx.send(root, &key, input).await?;
        Ok(Vec::new())
    }
}

/// Every party ends up with every party's `input`, ordered by rank.
pub async fn all_gather(ctx: &Context, input: Bytes, tag: &str) -> Result<Vec<Bytes>> {
    let key = ctx.next_collective_key(tag);
    let key = &key;
    // Sends and receives run together so bounded windows cannot deadlock.
    let sends = try_join_all(ctx.channels().map(|channel| channel.send(key, input.clone())));
    let (_, gathered) = try_join!(sends, collect(ctx, key, input.clone()))?;
    Ok(gathered)
}

/// Hands `inputs[r]` from `root` to rank `r`. Every party returns its own
/// share. Only the root's `inputs` are used; it must hold one entry per
/// party.
pub async fn scatter(ctx: &Context, inputs: &[Bytes], root: Rank, tag: &str) -> Result<Bytes> {
    check_root(ctx, root)?;
    let key = ctx.next_collective_key(tag);
    if ctx.rank() != root {
        return ctx.recv(root, &key).await;
    }

    if inputs.len() != ctx.world_size() {
        return Err(Error::Config(format!(
            "scatter needs {} inputs, got {}",
            ctx.world_size(),
            inputs.len()
        )));
    }
    let key = &key;
    try_join_all(
        ctx.channels()
            .map(|channel| channel.send(key, inputs[channel.peer_rank()].clone())),
    )
    .await?;
    Ok(inputs[root].clone())
}

/// Returns once every party has entered the barrier.
pub async fn barrier(ctx: &Context, tag: &str) -> Result<()> {
    all_gather(ctx, Bytes::new(), tag).await.map(|_| ())
}
