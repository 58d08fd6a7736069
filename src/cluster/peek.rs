//! Peek cursors: lazy, restartable, version-ordered iterators over
//! tag-filtered messages, composable across replica sets (merged) and across
//! time (multi).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::cluster::cell::Shutdown;
use crate::cluster::interface::{
    with_endpoint, LogMessage, PeekRequest, ReplicaError, ReplicaId, ServerCell,
};
use crate::cluster::log_set::LogSet;
use crate::cluster::log_system::LogSystem;
use crate::config::Config;
use crate::core::{Tag, TagLocality, Version};
use crate::error::FaultDomain;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeekError {
    /// History was exhausted while segments remained uncovered.
    #[error("peeked range no longer served by any generation")]
    WorkerRemoved,

    #[error("peek cancelled")]
    Cancelled,
}

impl PeekError {
    pub fn fault_domain(&self) -> FaultDomain {
        match self {
            PeekError::WorkerRemoved => FaultDomain::Epoch,
            PeekError::Cancelled => FaultDomain::Cancelled,
        }
    }
}

/// Reads one replica's tag stream over `[begin, end)`.
#[derive(Debug)]
pub struct ServerCursor {
    cell: Option<ServerCell>,
    tag: Tag,
    begin: Version,
    end: Version,
    messages: VecDeque<LogMessage>,
    config: Config,
    shutdown: Shutdown,
}

impl ServerCursor {
    fn new(
        cell: ServerCell,
        tag: Tag,
        begin: Version,
        end: Version,
        config: Config,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            cell: Some(cell),
            tag,
            begin,
            end,
            messages: VecDeque::new(),
            config,
            shutdown,
        }
    }

    /// A cursor over no replica: empty, and its readiness never fires.
    fn dead(tag: Tag, begin: Version, shutdown: Shutdown) -> Self {
        Self {
            cell: None,
            tag,
            begin,
            end: Version::MAX,
            messages: VecDeque::new(),
            config: Config::default(),
            shutdown,
        }
    }

    fn get_more(&mut self) -> Result<(), PeekError> {
        if self.shutdown.is_triggered() {
            return Err(PeekError::Cancelled);
        }
        let Some(cell) = &self.cell else {
            // Dead cursor: block until the owner goes away.
            self.shutdown.park();
            return Err(PeekError::Cancelled);
        };
        if self.begin >= self.end {
            return Ok(());
        }
        let req = PeekRequest {
            tag: self.tag,
            begin: self.begin,
        };
        match with_endpoint(cell, &self.config, |client| client.peek(&req)) {
            Ok(reply) => {
                for message in reply.messages {
                    if message.version >= self.begin && message.version < self.end {
                        self.messages.push_back(message);
                    }
                }
                if reply.end > self.begin {
                    self.begin = std::cmp::min(reply.end, self.end);
                }
                Ok(())
            }
            Err(ReplicaError::Cancelled) => Err(PeekError::Cancelled),
            Err(err) => {
                // Transient: the endpoint is absent, slow, or restarting.
                // The caller retries on its next get_more.
                debug!(tag = %self.tag, %err, "peek attempt absorbed");
                Ok(())
            }
        }
    }

    fn has_message(&self) -> bool {
        !self.messages.is_empty()
    }

    fn next(&mut self) -> Option<LogMessage> {
        self.messages.pop_front()
    }

    fn version(&self) -> Version {
        self.messages
            .front()
            .map(|m| m.version)
            .unwrap_or(self.begin)
    }

    fn fetched_to(&self) -> Version {
        self.begin
    }

    fn is_exhausted(&self) -> bool {
        self.cell.is_some() && self.begin >= self.end && self.messages.is_empty()
    }
}

/// Merges several cursors over the same range with a quorum discipline:
/// a message version is served once `required` children have fetched past
/// it (or once the designated best child has).
#[derive(Debug)]
pub struct MergedCursor {
    children: Vec<Cursor>,
    best: Option<usize>,
    required: usize,
    end: Version,
    frontier: Version,
    buffered: BTreeMap<(Version, u32), LogMessage>,
    output: VecDeque<LogMessage>,
}

impl MergedCursor {
    fn new(children: Vec<Cursor>, best: Option<usize>, required: usize, begin: Version, end: Version) -> Self {
        let required = required.clamp(1, children.len().max(1));
        Self {
            children,
            best,
            required,
            end,
            frontier: begin,
            buffered: BTreeMap::new(),
            output: VecDeque::new(),
        }
    }

    fn get_more(&mut self) -> Result<(), PeekError> {
        if let Some(best) = self.best {
            let child = &mut self.children[best];
            child.get_more()?;
            while let Some(message) = child.next() {
                self.output.push_back(message);
            }
            self.frontier = child.fetched_to();
            return Ok(());
        }

        for child in &mut self.children {
            child.get_more()?;
        }
        for child in &mut self.children {
            while let Some(message) = child.next() {
                self.buffered
                    .insert((message.version, message.sub), message);
            }
        }

        let mut fronts: Vec<Version> = self.children.iter().map(Cursor::fetched_to).collect();
        fronts.sort_unstable_by(|a, b| b.cmp(a));
        let frontier = fronts
            .get(self.required - 1)
            .copied()
            .unwrap_or(self.frontier);
        if frontier > self.frontier {
            self.frontier = std::cmp::min(frontier, self.end);
        }

        let frontier = self.frontier;
        let mut served = self.buffered.split_off(&(frontier, 0));
        std::mem::swap(&mut served, &mut self.buffered);
        for (_, message) in served {
            self.output.push_back(message);
        }
        Ok(())
    }

    fn has_message(&self) -> bool {
        !self.output.is_empty()
    }

    fn next(&mut self) -> Option<LogMessage> {
        self.output.pop_front()
    }

    fn version(&self) -> Version {
        self.output
            .front()
            .map(|m| m.version)
            .unwrap_or(self.frontier)
    }

    fn fetched_to(&self) -> Version {
        self.frontier
    }

    fn is_exhausted(&self) -> bool {
        self.frontier >= self.end && self.output.is_empty() && self.buffered.is_empty()
    }
}

/// Concatenates cursors along version order, switching at per-segment
/// epoch-end versions. Segments are ordered oldest first.
#[derive(Debug)]
pub struct MultiCursor {
    segments: Vec<(Cursor, Version)>,
    current: usize,
}

impl MultiCursor {
    fn new(segments: Vec<(Cursor, Version)>) -> Self {
        Self {
            segments,
            current: 0,
        }
    }

    /// Exclusive switch versions, oldest segment first.
    pub fn switch_versions(&self) -> Vec<Version> {
        self.segments.iter().map(|(_, end)| *end).collect()
    }

    fn advance_segment(&mut self) {
        while self.current + 1 < self.segments.len()
            && self.segments[self.current].0.is_exhausted()
        {
            self.current += 1;
        }
    }

    fn get_more(&mut self) -> Result<(), PeekError> {
        if self.segments.is_empty() {
            return Ok(());
        }
        self.advance_segment();
        self.segments[self.current].0.get_more()
    }

    fn has_message(&self) -> bool {
        self.segments
            .get(self.current)
            .is_some_and(|(cursor, _)| cursor.has_message())
    }

    fn next(&mut self) -> Option<LogMessage> {
        self.segments.get_mut(self.current)?.0.next()
    }

    fn version(&self) -> Version {
        self.segments
            .get(self.current)
            .map(|(cursor, _)| cursor.version())
            .unwrap_or(Version::ZERO)
    }

    fn fetched_to(&self) -> Version {
        self.segments
            .get(self.current)
            .map(|(cursor, _)| cursor.fetched_to())
            .unwrap_or(Version::ZERO)
    }

    fn is_exhausted(&self) -> bool {
        self.segments
            .iter()
            .all(|(cursor, _)| cursor.is_exhausted())
    }
}

/// Peek cursor variants, composed by value.
#[derive(Debug)]
pub enum Cursor {
    Server(ServerCursor),
    Merged(MergedCursor),
    Multi(MultiCursor),
}

impl Cursor {
    pub(crate) fn dead(tag: Tag, begin: Version, shutdown: Shutdown) -> Cursor {
        Cursor::Server(ServerCursor::dead(tag, begin, shutdown))
    }

    /// Fetch the next batch. Blocks for at most one transport round trip;
    /// a dead cursor blocks until the owning system is dropped.
    pub fn get_more(&mut self) -> Result<(), PeekError> {
        match self {
            Cursor::Server(c) => c.get_more(),
            Cursor::Merged(c) => c.get_more(),
            Cursor::Multi(c) => c.get_more(),
        }
    }

    pub fn has_message(&self) -> bool {
        match self {
            Cursor::Server(c) => c.has_message(),
            Cursor::Merged(c) => c.has_message(),
            Cursor::Multi(c) => c.has_message(),
        }
    }

    pub fn next(&mut self) -> Option<LogMessage> {
        match self {
            Cursor::Server(c) => c.next(),
            Cursor::Merged(c) => c.next(),
            Cursor::Multi(c) => c.next(),
        }
    }

    /// Version of the next message, or the cursor's frontier when no
    /// message is buffered.
    pub fn version(&self) -> Version {
        match self {
            Cursor::Server(c) => c.version(),
            Cursor::Merged(c) => c.version(),
            Cursor::Multi(c) => c.version(),
        }
    }

    fn fetched_to(&self) -> Version {
        match self {
            Cursor::Server(c) => c.fetched_to(),
            Cursor::Merged(c) => c.fetched_to(),
            Cursor::Multi(c) => c.fetched_to(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match self {
            Cursor::Server(c) => c.is_exhausted(),
            Cursor::Merged(c) => c.is_exhausted(),
            Cursor::Multi(c) => c.is_exhausted(),
        }
    }

    /// Dead cursors never become ready.
    pub fn is_dead(&self) -> bool {
        matches!(self, Cursor::Server(c) if c.cell.is_none())
    }
}

impl LogSystem {
    fn server_cursor(&self, cell: ServerCell, tag: Tag, begin: Version, end: Version) -> Cursor {
        Cursor::Server(ServerCursor::new(
            cell,
            tag,
            begin,
            end,
            self.config().clone(),
            self.shutdown_token(),
        ))
    }

    fn dead_cursor(&self, tag: Tag, begin: Version) -> Cursor {
        Cursor::dead(tag, begin, self.shutdown_token())
    }

    fn set_read_cursor(&self, set: &LogSet, tag: Tag, begin: Version, end: Version) -> Cursor {
        let children: Vec<Cursor> = set
            .servers
            .iter()
            .map(|cell| self.server_cursor(Arc::clone(cell), tag, begin, end))
            .collect();
        Cursor::Merged(MergedCursor::new(
            children,
            None,
            set.read_quorum(),
            begin,
            end,
        ))
    }

    fn router_cursor(&self, routers: &[ServerCell], tag: Tag, begin: Version, end: Version) -> Cursor {
        let required = routers.len();
        let children: Vec<Cursor> = routers
            .iter()
            .map(|cell| self.server_cursor(Arc::clone(cell), tag, begin, end))
            .collect();
        Cursor::Merged(MergedCursor::new(children, None, required, begin, end))
    }

    /// One generation's cursor: the best-matching set's single best replica
    /// when a best set exists, otherwise a read-quorum over the next best
    /// (or first) set.
    fn generation_cursor(
        &self,
        sets: &[Arc<LogSet>],
        tag: Tag,
        begin: Version,
        end: Version,
    ) -> Cursor {
        if sets.is_empty() {
            return self.dead_cursor(tag, begin);
        }
        let mut best = None;
        let mut next_best = None;
        for (i, set) in sets.iter().enumerate() {
            if set.has_best_policy {
                if best.is_none() && tag.matches_set_locality(set.locality) {
                    best = Some(i);
                }
                if next_best.is_none() {
                    next_best = Some(i);
                }
            }
        }
        match best {
            Some(i) => {
                let set = &sets[i];
                let children: Vec<Cursor> = set
                    .servers
                    .iter()
                    .map(|cell| self.server_cursor(Arc::clone(cell), tag, begin, end))
                    .collect();
                let hint = set.best_location_for(tag);
                Cursor::Merged(MergedCursor::new(children, hint, 1, begin, end))
            }
            None => {
                let i = next_best.unwrap_or(0);
                self.set_read_cursor(&sets[i], tag, begin, end)
            }
        }
    }

    fn local_sets_of(sets: &[Arc<LogSet>]) -> Vec<Arc<LogSet>> {
        sets.iter()
            .filter(|set| set.is_local && set.has_servers())
            .cloned()
            .collect()
    }

    /// Assemble a cursor over `[begin, end)` for `tag`, crossing historical
    /// generations as needed.
    pub(crate) fn peek_all(
        &self,
        begin: Version,
        end: Version,
        tag: Tag,
        throw_if_dead: bool,
    ) -> Result<Cursor, PeekError> {
        let local = Self::local_sets_of(&self.current_sets());
        let mut last_begin = local
            .iter()
            .map(|set| set.start_version)
            .max()
            .unwrap_or(Version::ZERO);

        if begin >= last_begin {
            return Ok(self.generation_cursor(&local, tag, begin, end));
        }

        // Newest-first while walking history; reversed for the multi cursor.
        let mut segments: Vec<(Cursor, Version)> = Vec::new();
        if last_begin < end {
            segments.push((self.generation_cursor(&local, tag, last_begin, end), end));
        }

        let old = self.old_generations();
        let mut i = 0;
        while begin < last_begin {
            if i == old.len() {
                if tag == Tag::TXS {
                    break;
                }
                debug!(%tag, %begin, %last_begin, "peek ran out of history");
                if throw_if_dead {
                    return Err(PeekError::WorkerRemoved);
                }
                return Ok(self.dead_cursor(tag, begin));
            }
            let gen_sets = Self::local_sets_of(&old[i].log_sets());
            let this_begin = std::cmp::max(
                begin,
                gen_sets
                    .iter()
                    .map(|set| set.start_version)
                    .max()
                    .unwrap_or(Version::ZERO),
            );
            if this_begin < last_begin {
                if this_begin < end {
                    let seg_end = std::cmp::min(last_begin, end);
                    segments.push((
                        self.generation_cursor(&gen_sets, tag, this_begin, seg_end),
                        seg_end,
                    ));
                }
                last_begin = this_begin;
            }
            i += 1;
        }

        segments.reverse();
        Ok(Cursor::Multi(MultiCursor::new(segments)))
    }

    /// Peek a log-router-served tag from the routers of the unique set that
    /// carries them, prepending historical routers as needed.
    fn peek_remote(&self, begin: Version, tag: Tag) -> Cursor {
        let current = self.current_sets();
        let mut routers: Option<Vec<ServerCell>> = None;
        let mut last_begin = Version::ZERO;
        for set in &current {
            if set.is_local {
                last_begin = std::cmp::max(last_begin, set.start_version);
            }
            if set.has_routers() {
                routers = Some(set.routers());
            }
        }
        let Some(routers) = routers else {
            return self.dead_cursor(tag, begin);
        };
        let end = self.peek_end();
        if begin >= last_begin {
            return self.router_cursor(&routers, tag, begin, end);
        }

        let mut segments: Vec<(Cursor, Version)> = Vec::new();
        segments.push((self.router_cursor(&routers, tag, last_begin, end), end));

        let old = self.old_generations();
        let mut i = 0;
        while begin < last_begin {
            if i == old.len() {
                return self.dead_cursor(tag, begin);
            }
            let gen_sets = old[i].log_sets();
            let mut gen_routers: Option<Vec<ServerCell>> = None;
            let mut this_begin = begin;
            for set in &gen_sets {
                if set.is_local {
                    this_begin = std::cmp::max(this_begin, set.start_version);
                }
                if set.has_routers() {
                    gen_routers = Some(set.routers());
                }
            }
            let Some(gen_routers) = gen_routers else {
                return self.dead_cursor(tag, begin);
            };
            if this_begin < last_begin {
                segments.push((
                    self.router_cursor(&gen_routers, tag, this_begin, last_begin),
                    last_begin,
                ));
                last_begin = this_begin;
            }
            i += 1;
        }

        segments.reverse();
        Cursor::Multi(MultiCursor::new(segments))
    }

    /// Peek a single tag's ordered history starting at `begin`.
    pub fn peek(&self, begin: Version, tag: Tag) -> Cursor {
        if self.current_sets().is_empty() {
            debug!(%tag, %begin, "peek with no log sets");
            return self.dead_cursor(tag, begin);
        }
        if tag.locality == TagLocality::REMOTE_LOG {
            return self.peek_remote(begin, tag);
        }
        self.peek_all(begin, self.peek_end(), tag, false)
            .unwrap_or_else(|_| self.dead_cursor(tag, begin))
    }

    /// Union-merge across several tags.
    pub fn peek_tags(&self, begin: Version, tags: &[Tag]) -> Cursor {
        match tags {
            [] => self.dead_cursor(Tag::new(TagLocality::INVALID, 0), begin),
            [tag] => self.peek(begin, *tag),
            _ => {
                let children: Vec<Cursor> =
                    tags.iter().map(|&tag| self.peek(begin, tag)).collect();
                let required = children.len();
                Cursor::Merged(MergedCursor::new(
                    children,
                    None,
                    required,
                    begin,
                    self.peek_end(),
                ))
            }
        }
    }

    /// Best-set read within the locality-matched sets; used by storage
    /// workers and router-local reads. Strict: running out of history is an
    /// error.
    fn peek_local(&self, tag: Tag, begin: Version, end: Version) -> Result<Cursor, PeekError> {
        let sets = self.current_sets();
        let mut best = None;
        let mut found_special = false;
        for (t, set) in sets.iter().enumerate() {
            if set.has_servers()
                && set.has_best_policy
                && (tag.matches_set_locality(set.locality)
                    || (set.is_local && tag.locality == TagLocality::LOG_ROUTER))
            {
                if set.locality == TagLocality::SPECIAL {
                    found_special = true;
                }
                best = Some(t);
                break;
            }
        }
        let Some(best) = best else {
            debug!(%tag, %begin, "no best set for local peek");
            return Ok(self.dead_cursor(tag, begin));
        };
        let best_set = Arc::clone(&sets[best]);
        let best_loc = best_set.best_location_for(tag).unwrap_or(0);

        if begin >= best_set.start_version {
            return Ok(self.server_cursor(
                Arc::clone(&best_set.servers[best_loc]),
                tag,
                begin,
                end,
            ));
        }

        let mut segments: Vec<(Cursor, Version)> = Vec::new();
        if best_set.start_version < end {
            segments.push((
                self.server_cursor(
                    Arc::clone(&best_set.servers[best_loc]),
                    tag,
                    best_set.start_version,
                    end,
                ),
                end,
            ));
        }
        let mut last_begin = best_set.start_version;

        let old = self.old_generations();
        let mut i = 0;
        while begin < last_begin {
            if i == old.len() {
                debug!(%tag, %begin, %last_begin, "local peek ran out of history");
                return Err(PeekError::WorkerRemoved);
            }
            let gen_sets = old[i].log_sets();
            let mut best_old = None;
            for (t, set) in gen_sets.iter().enumerate() {
                if set.has_servers()
                    && set.has_best_policy
                    && (tag.matches_set_locality(set.locality)
                        || (set.is_local && tag.locality == TagLocality::LOG_ROUTER))
                {
                    if set.locality == TagLocality::SPECIAL {
                        found_special = true;
                    }
                    best_old = Some(t);
                    break;
                }
            }

            if found_special {
                // A special-locality set subsumes every tag; read the rest of
                // the range through the general assembly.
                let seg_end = std::cmp::min(last_begin, end);
                segments.push((self.peek_all(begin, seg_end, tag, true)?, seg_end));
                break;
            }

            let Some(best_old) = best_old else {
                i += 1;
                continue;
            };
            let o_set = Arc::clone(&gen_sets[best_old]);
            let this_begin = std::cmp::max(o_set.start_version, begin);
            if this_begin < last_begin {
                if this_begin < end {
                    let seg_end = std::cmp::min(last_begin, end);
                    segments.push((self.set_read_cursor(&o_set, tag, this_begin, seg_end), seg_end));
                }
                last_begin = this_begin;
            }
            i += 1;
        }

        segments.reverse();
        Ok(Cursor::Multi(MultiCursor::new(segments)))
    }

    /// Peek a storage worker's full tag history: `history` is the worker's
    /// (version, prior tag) hops, most recent first.
    pub fn peek_single(
        &self,
        begin: Version,
        tag: Tag,
        history: &[(Version, Tag)],
    ) -> Result<Cursor, PeekError> {
        let mut hops: Vec<(Version, Tag)> = history.to_vec();
        while hops.last().is_some_and(|(version, _)| begin >= *version) {
            hops.pop();
        }

        if hops.is_empty() {
            return self.peek_local(tag, begin, self.peek_end());
        }

        let mut segments: Vec<(Cursor, Version)> = Vec::new();
        let end = self.peek_end();
        segments.push((self.peek_local(tag, hops[0].0, end)?, end));
        for i in 0..hops.len() {
            let seg_begin = if i + 1 == hops.len() {
                begin
            } else {
                std::cmp::max(hops[i + 1].0, begin)
            };
            segments.push((
                self.peek_local(hops[i].1, seg_begin, hops[i].0)?,
                hops[i].0,
            ));
        }
        segments.reverse();
        Ok(Cursor::Multi(MultiCursor::new(segments)))
    }

    /// Peek for a log router reading its own input from the primary side,
    /// selecting the generation the router belongs to.
    pub fn peek_log_router(&self, begin: Version, tag: Tag, router_id: ReplicaId) -> Cursor {
        let sets = self.current_sets();
        let found = sets
            .iter()
            .any(|set| set.routers().iter().any(|cell| cell.get().id == router_id));
        if found {
            if self.stopped {
                let local = Self::local_sets_of(&sets);
                return self.generation_cursor(&local, tag, begin, self.peek_end());
            }
            for set in &sets {
                if set.has_servers() && set.is_local && set.has_best_policy {
                    let loc = set.best_location_for(tag).unwrap_or(0);
                    return self.server_cursor(
                        Arc::clone(&set.servers[loc]),
                        tag,
                        begin,
                        self.peek_end(),
                    );
                }
            }
        }

        for old in self.old_generations() {
            let gen_sets = old.log_sets();
            let found = gen_sets
                .iter()
                .any(|set| set.routers().iter().any(|cell| cell.get().id == router_id));
            if found {
                let local = Self::local_sets_of(&gen_sets);
                return self.generation_cursor(&local, tag, begin, old.epoch_end);
            }
        }
        self.dead_cursor(tag, begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log_system::OldGeneration;
    use crate::cluster::testutil::{fake_set, message, system_with, FakeLogServer};
    use crate::core::TagLocality;

    const DC0: TagLocality = TagLocality::new(0);

    fn data_tag(id: u16) -> Tag {
        Tag::new(DC0, id)
    }

    /// Pull everything out of a cursor, bounded to keep a broken cursor from
    /// spinning the test forever.
    fn drain(cursor: &mut Cursor) -> Vec<u64> {
        let mut versions = Vec::new();
        for _ in 0..64 {
            while let Some(message) = cursor.next() {
                versions.push(message.version.get());
            }
            if cursor.is_exhausted() {
                break;
            }
            if cursor.get_more().is_err() {
                break;
            }
            if !cursor.has_message() && cursor.is_exhausted() {
                break;
            }
        }
        versions
    }

    fn three_generation_system() -> (Arc<crate::cluster::log_system::LogSystem>, Tag) {
        let tag = data_tag(0);
        // G1 carries 500..1000, G2 carries 1000..2000, current starts at 2000.
        let g1 = FakeLogServer::with_messages(
            Version::new(1_000),
            tag,
            vec![message(500, 0, tag), message(900, 0, tag)],
        );
        let g2 = FakeLogServer::with_messages(
            Version::new(2_000),
            tag,
            vec![message(1_000, 0, tag), message(1_500, 0, tag)],
        );
        let current = FakeLogServer::with_messages(
            Version::new(2_600),
            tag,
            vec![message(2_000, 0, tag), message(2_400, 0, tag)],
        );

        let system = system_with(|parts| {
            parts.sets = vec![fake_set(
                &[current.clone()],
                1,
                0,
                DC0,
                true,
                Version::new(2_000),
            )];
            // History is most recent first.
            parts.old = vec![
                Arc::new(OldGeneration::new(
                    vec![fake_set(&[g2.clone()], 1, 0, DC0, true, Version::new(1_000))],
                    0,
                    Version::new(2_000),
                )),
                Arc::new(OldGeneration::new(
                    vec![fake_set(&[g1.clone()], 1, 0, DC0, true, Version::ZERO)],
                    0,
                    Version::new(1_000),
                )),
            ];
        });
        (system, tag)
    }

    #[test]
    fn multi_generation_segments_tile_the_range() {
        let (system, tag) = three_generation_system();
        let cursor = system
            .peek_all(Version::new(500), Version::new(2_500), tag, false)
            .unwrap();
        let Cursor::Multi(multi) = &cursor else {
            panic!("expected a multi cursor");
        };
        let switches: Vec<u64> = multi
            .switch_versions()
            .iter()
            .map(|v| v.get())
            .collect();
        assert_eq!(switches, vec![1_000, 2_000, 2_500]);
    }

    #[test]
    fn cursor_reads_messages_across_generations_in_order() {
        let (system, tag) = three_generation_system();
        let mut cursor = system
            .peek_all(Version::new(500), Version::new(2_500), tag, false)
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![500, 900, 1_000, 1_500, 2_000, 2_400]);
    }

    #[test]
    fn begin_at_current_start_uses_a_single_generation() {
        let (system, tag) = three_generation_system();
        let mut cursor = system.peek(Version::new(2_000), tag);
        assert!(matches!(cursor, Cursor::Merged(_)));
        let fetched = drain(&mut cursor);
        assert_eq!(fetched, vec![2_000, 2_400]);
    }

    #[test]
    fn exhausted_history_yields_a_dead_cursor() {
        let tag = data_tag(3);
        let current = FakeLogServer::new(Version::new(2_600));
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(
                &[current],
                1,
                0,
                DC0,
                true,
                Version::new(2_000),
            )];
        });
        let cursor = system.peek(Version::new(100), tag);
        assert!(cursor.is_dead());

        let err = system
            .peek_all(Version::new(100), Version::new(2_500), data_tag(3), true)
            .unwrap_err();
        assert_eq!(err, PeekError::WorkerRemoved);
    }

    #[test]
    fn txs_tag_tolerates_exhausted_history() {
        let current = FakeLogServer::new(Version::new(2_600));
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(
                &[current],
                1,
                0,
                DC0,
                true,
                Version::new(2_000),
            )];
        });
        let cursor = system
            .peek_all(Version::new(100), Version::new(2_500), Tag::TXS, false)
            .unwrap();
        assert!(!cursor.is_dead());
    }

    #[test]
    fn peek_single_discards_hops_entirely_before_begin() {
        let (system, tag) = three_generation_system();
        let history = vec![(Version::new(100), data_tag(9))];
        let cursor = system
            .peek_single(Version::new(2_000), tag, &history)
            .unwrap();
        // The hop is irrelevant at this begin; a plain best-set cursor comes
        // back instead of a multi cursor.
        assert!(matches!(cursor, Cursor::Server(_)));
    }

    #[test]
    fn peek_single_switches_tags_at_history_hops() {
        let (system, tag) = three_generation_system();
        let prior = data_tag(9);
        let cursor = system
            .peek_single(Version::new(600), tag, &[(Version::new(2_100), prior)])
            .unwrap();
        let Cursor::Multi(multi) = &cursor else {
            panic!("expected a multi cursor");
        };
        let switches = multi.switch_versions();
        assert_eq!(switches[0], Version::new(2_100));
        assert_eq!(switches[1], Version::MAX);
    }

    #[test]
    fn empty_tag_list_peeks_dead() {
        let (system, _) = three_generation_system();
        assert!(system.peek_tags(Version::ZERO, &[]).is_dead());
    }

    #[test]
    fn peek_tags_merges_across_tags_in_version_order() {
        let tag_a = data_tag(0);
        let tag_b = data_tag(1);
        let server = FakeLogServer::with_messages(
            Version::new(100),
            tag_a,
            vec![message(10, 0, tag_a), message(30, 0, tag_a)],
        );
        server
            .state
            .lock()
            .unwrap()
            .messages
            .insert(tag_b, vec![message(20, 0, tag_b)]);
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(&[server], 1, 0, DC0, true, Version::ZERO)];
        });
        let mut cursor = system.peek_tags(Version::ZERO, &[tag_a, tag_b]);
        assert_eq!(drain(&mut cursor), vec![10, 20, 30]);
    }

    #[test]
    fn router_peek_reads_routers_of_the_unique_router_set() {
        let tag = Tag::remote_log(0);
        let router = FakeLogServer::with_messages(
            Version::new(300),
            tag,
            vec![message(100, 0, tag), message(200, 0, tag)],
        );
        let server = FakeLogServer::new(Version::new(300));
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(&[server], 1, 0, DC0, true, Version::ZERO)];
        });
        system.current_sets()[0]
            .set_routers(vec![crate::cluster::interface::server_cell(
                router.endpoint(crate::cluster::testutil::zone("zr")),
            )]);
        let mut cursor = system.peek(Version::ZERO, tag);
        assert_eq!(drain(&mut cursor), vec![100, 200]);
    }

    #[test]
    fn router_peek_without_routers_is_dead() {
        let (system, _) = three_generation_system();
        assert!(system.peek(Version::ZERO, Tag::remote_log(0)).is_dead());
    }

    #[test]
    fn log_router_peek_selects_the_owning_generation() {
        let (system, tag) = three_generation_system();
        let router = FakeLogServer::new(Version::new(1_000));
        let router_cell = crate::cluster::interface::server_cell(
            router.endpoint(crate::cluster::testutil::zone("zr")),
        );
        // Attach the router to the oldest generation.
        let old = system.old_generations();
        old[1].log_sets()[0].set_routers(vec![router_cell]);

        let cursor = system.peek_log_router(Version::new(600), tag, router.id);
        // Bounded by the owning generation's epoch end.
        let Cursor::Merged(_) = cursor else {
            panic!("expected a merged cursor over the old generation");
        };

        let unknown = system.peek_log_router(Version::new(600), tag, ReplicaId::random());
        assert!(unknown.is_dead());
    }
}
