//! Channel pools.
//!
//! The engine owns two fixed pools of backend channels, one per
//! [`ChannelKind`]. A source gets a channel from its pool when it starts
//! playing:
//!
//! 1. a channel the source already holds is reused;
//! 2. otherwise the scan starts at the round-robin cursor and takes the first
//!    channel that is vacant or whose occupant has finished;
//! 3. otherwise the first channel whose occupant is not a playing priority
//!    source is stolen;
//! 4. otherwise nothing is allocated.

use std::fmt;

use aural_common::ids::SourceSerial;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Backend, ChannelKind, ChannelOutput};
use crate::error::SoundResult;

/// Identifies one channel within the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    /// Pool the channel belongs to.
    pub kind: ChannelKind,
    /// Slot within the pool.
    pub index: usize,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.index)
    }
}

/// One backend channel plus the serial of the source attached to it.
pub struct Channel {
    /// Where the channel lives.
    pub id: ChannelId,
    /// Backend output.
    pub output: Box<dyn ChannelOutput>,
    /// Source whose data the output currently holds.
    pub attached: Option<SourceSerial>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

/// How a channel's current occupant may be displaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// Nobody holds the channel.
    Vacant,
    /// The occupant exists but is not playing.
    Idle,
    /// The occupant is playing and may be stolen from.
    Busy,
    /// The occupant is a playing priority source.
    Protected,
}

impl Occupancy {
    const fn is_free(self) -> bool {
        matches!(self, Self::Vacant | Self::Idle)
    }
}

/// Fixed-size pool of channels of one kind.
#[derive(Debug)]
pub struct ChannelPool {
    kind: ChannelKind,
    channels: Vec<Channel>,
    occupants: Vec<Option<String>>,
    cursor: usize,
}

impl ChannelPool {
    /// Create `count` channels on the backend.
    pub fn create(backend: &mut dyn Backend, kind: ChannelKind, count: usize) -> SoundResult<Self> {
        let mut channels = Vec::with_capacity(count);
        for index in 0..count {
            channels.push(Channel {
                id: ChannelId { kind, index },
                output: backend.create_channel(kind)?,
                attached: None,
            });
        }
        debug!("Created {} {:?} channels", count, kind);
        Ok(Self::from_channels(kind, channels))
    }

    fn from_channels(kind: ChannelKind, channels: Vec<Channel>) -> Self {
        let occupants = vec![None; channels.len()];
        Self {
            kind,
            channels,
            occupants,
            cursor: 0,
        }
    }

    /// Pool kind.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the pool has no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Position the next scan starts from.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Name of the source holding a slot.
    #[must_use]
    pub fn occupant(&self, index: usize) -> Option<&str> {
        self.occupants.get(index).and_then(Option::as_deref)
    }

    /// Slot held by a source, if any.
    #[must_use]
    pub fn held_by(&self, name: &str) -> Option<usize> {
        self.occupants
            .iter()
            .position(|o| o.as_deref() == Some(name))
    }

    /// Channel at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Mutable channel at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(index)
    }

    /// Pick a slot for `name`.
    ///
    /// `occupancy[i]` describes the current holder of slot `i`. Returns the
    /// slot index; the slot is recorded as held by `name` and the cursor moves
    /// past it. The caller stops whatever the previous holder was playing.
    pub fn allocate(&mut self, name: &str, occupancy: &[Occupancy]) -> Option<usize> {
        if let Some(index) = self.held_by(name) {
            return Some(index);
        }

        let n = self.channels.len();
        if n == 0 {
            return None;
        }
        let state = |i: usize| occupancy.get(i).copied().unwrap_or(Occupancy::Vacant);
        let scan = || (0..n).map(|k| (self.cursor + k) % n);

        let chosen = scan()
            .find(|&i| state(i).is_free())
            .or_else(|| scan().find(|&i| state(i) != Occupancy::Protected))?;

        self.occupants[chosen] = Some(name.to_string());
        self.cursor = (chosen + 1) % n;
        Some(chosen)
    }

    /// Forget the holder of a slot.
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.occupants.get_mut(index) {
            *slot = None;
        }
    }

    /// Forget every slot held by `name`.
    pub fn release_name(&mut self, name: &str) {
        for slot in &mut self.occupants {
            if slot.as_deref() == Some(name) {
                *slot = None;
            }
        }
    }

    /// Iterate over channels.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Iterate mutably over channels.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    /// Close every channel.
    pub fn close_all(&mut self) {
        for channel in &mut self.channels {
            channel.output.stop();
            channel.output.close();
            channel.attached = None;
        }
        self.occupants.iter_mut().for_each(|o| *o = None);
        self.cursor = 0;
    }
}

/// Both pools.
#[derive(Debug)]
pub struct ChannelPools {
    /// Non-streaming pool.
    pub normal: ChannelPool,
    /// Streaming pool.
    pub streaming: ChannelPool,
}

impl ChannelPools {
    /// Create both pools on a backend.
    pub fn create(backend: &mut dyn Backend, normal: usize, streaming: usize) -> SoundResult<Self> {
        Ok(Self {
            normal: ChannelPool::create(backend, ChannelKind::Normal, normal)?,
            streaming: ChannelPool::create(backend, ChannelKind::Streaming, streaming)?,
        })
    }

    /// Pool for a kind.
    #[must_use]
    pub const fn pool(&self, kind: ChannelKind) -> &ChannelPool {
        match kind {
            ChannelKind::Normal => &self.normal,
            ChannelKind::Streaming => &self.streaming,
        }
    }

    /// Mutable pool for a kind.
    pub fn pool_mut(&mut self, kind: ChannelKind) -> &mut ChannelPool {
        match kind {
            ChannelKind::Normal => &mut self.normal,
            ChannelKind::Streaming => &mut self.streaming,
        }
    }

    /// Channel by id.
    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.pool(id.kind).get(id.index)
    }

    /// Mutable channel by id.
    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.pool_mut(id.kind).get_mut(id.index)
    }

    /// Output of a channel, but only while `serial` is still attached to it.
    pub fn output_for(&mut self, id: ChannelId, serial: SourceSerial) -> Option<&mut dyn ChannelOutput> {
        let channel = self.get_mut(id)?;
        if channel.attached == Some(serial) {
            Some(channel.output.as_mut())
        } else {
            None
        }
    }

    /// Whether the channel is producing audio for `serial`.
    #[must_use]
    pub fn is_playing(&self, id: ChannelId, serial: SourceSerial) -> bool {
        self.get(id)
            .is_some_and(|c| c.attached == Some(serial) && c.output.is_playing())
    }

    /// Close every channel in both pools.
    pub fn close_all(&mut self) {
        self.normal.close_all();
        self.streaming.close_all();
    }
}
