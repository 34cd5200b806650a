//! Loop Batcher (spec §4.G): a three-state machine that replaces a
//! loop body's per-iteration tags with a single cached replay, scaled by a
//! repeat count, instead of re-running `handle_tag` once per iteration.
//! Worker-local; no locking needed.

use crate::protocol::Tag;
use crate::types::NodeIndex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NoLoop,
    BuildingLoop,
    LoopProgress,
}

#[derive(Default)]
pub struct LoopBatcher {
    state_inner: Option<LoopState>,
    loop_count: u64,
    cache: Vec<Tag>,
    pub first_loop_vert: Option<NodeIndex>,
}

impl LoopBatcher {
    pub fn new() -> Self {
        Self {
            state_inner: None,
            loop_count: 0,
            cache: Vec::new(),
            first_loop_vert: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state_inner.unwrap_or(LoopState::NoLoop)
    }

    pub fn loop_start(&mut self, count: u64) {
        self.state_inner = Some(LoopState::BuildingLoop);
        self.loop_count = count;
        self.cache.clear();
    }

    /// Offers a tag to the batcher. Returns `true` if it was absorbed into
    /// the cache (the caller must not run `handle_tag` for it directly).
    pub fn offer(&mut self, tag: Tag) -> bool {
        if self.state() == LoopState::BuildingLoop {
            self.cache.push(tag);
            true
        } else {
            false
        }
    }

    /// `dump_loop`: replays the cache through `handle_tag`, scaled by the
    /// recorded repeat count, and records the replay in `loop_counter`.
    /// A cache-empty dump (no tags were ever offered) is a no-op reset.
    /// `handle_tag` is async because replaying a tag may need to bind a
    /// fresh external node, which retries against the Process Data Store.
    pub async fn dump_loop<F, Fut>(&mut self, loop_counter: &mut u64, mut handle_tag: F)
    where
        F: FnMut(&Tag, u64) -> Fut,
        Fut: std::future::Future<Output = NodeIndex>,
    {
        if self.cache.is_empty() {
            self.state_inner = Some(LoopState::NoLoop);
            return;
        }

        *loop_counter += 1;
        let repeats = self.loop_count.max(1);
        let cached = std::mem::take(&mut self.cache);

        for (i, tag) in cached.iter().enumerate() {
            let target = handle_tag(tag, repeats).await;
            if i == 0 {
                self.state_inner = Some(LoopState::LoopProgress);
                self.first_loop_vert = Some(target);
            }
        }

        debug!(loop_counter = *loop_counter, repeats, cached = cached.len(), "loop dumped");
        self.state_inner = Some(LoopState::NoLoop);
    }
}
