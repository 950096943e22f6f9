//! Bidirectional links.
//!
//! A link between A and B is two entries drawn from the shared link pool:
//! one in A's list naming B and one in B's list naming A. Either side's death
//! removes both and sends the survivor a `System`/[`EXIT_TAG`] message from
//! [`ActorId::SYSTEM`] carrying the dead actor's id and exit reason. Linked
//! actors are notified, not killed; what to do about a partner's death is the
//! survivor's decision.

use tracing::trace;

use crate::actor::ActorId;
use crate::error::{Error, Result};
use crate::message::{ExitReason, EXIT_TAG};
use crate::scheduler::{Kernel, KernelState};

impl KernelState {
    fn linked(&self, a: ActorId, b: ActorId) -> bool {
        self.actors
            .get(a.slot())
            .is_some_and(|cb| cb.links.find(&self.link_nodes, |&p| p == b).is_some())
    }

    pub(crate) fn link(&mut self, me: ActorId, target: ActorId) -> Result<()> {
        if target == me {
            return Err(Error::InvalidArgument("link to self"));
        }
        if !self.is_live(target) {
            return Err(Error::InvalidArgument("link target is not alive"));
        }
        if self.linked(me, target) {
            return Ok(());
        }
        if self.link_nodes.capacity() - self.link_nodes.len() < 2 {
            return Err(Error::ResourceExhausted("link entries"));
        }
        for (owner, partner) in [(me, target), (target, me)] {
            if let Some(cb) = self.actors.get_mut(owner.slot()) {
                cb.links
                    .append(&mut self.link_nodes, partner)
                    .map_err(|_| Error::ResourceExhausted("link entries"))?;
            }
        }
        trace!(%me, %target, "linked");
        Ok(())
    }

    /// Remove `partner` from `owner`'s link list, if present.
    fn drop_link(&mut self, owner: ActorId, partner: ActorId) -> bool {
        let Some(cb) = self.actors.get_mut(owner.slot()) else {
            return false;
        };
        if cb.id != owner {
            return false;
        }
        cb.links
            .find_remove(&mut self.link_nodes, |&p| p == partner)
            .is_some()
    }

    pub(crate) fn unlink(&mut self, me: ActorId, target: ActorId) {
        if self.drop_link(me, target) | self.drop_link(target, me) {
            trace!(%me, %target, "unlinked");
        }
    }

    /// Tear down `dead`'s links and tell each live partner.
    pub(crate) fn propagate_exit(&mut self, dead: ActorId, reason: ExitReason, notify: bool) {
        let Some(cb) = self.actors.get_mut(dead.slot()) else {
            return;
        };
        let mut links = std::mem::take(&mut cb.links);
        while let Some(partner) = links.pop_front(&mut self.link_nodes) {
            self.drop_link(partner, dead);
            if !notify || !self.is_live(partner) {
                continue;
            }
            self.send_notice(partner, EXIT_TAG, dead, reason, None);
        }
    }
}

impl Kernel {
    pub(crate) fn link(&self, me: ActorId, target: ActorId) -> Result<()> {
        self.current_slot(me)?;
        self.state().link(me, target)
    }

    pub(crate) fn unlink(&self, me: ActorId, target: ActorId) -> Result<()> {
        self.current_slot(me)?;
        self.state().unlink(me, target);
        Ok(())
    }
}
