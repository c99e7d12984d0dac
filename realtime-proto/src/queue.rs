use std::{collections::VecDeque, time::Instant};

use tracing::trace;

use crate::{
    error::{codes, Error, ErrorInfo},
    protocol::ProtocolMessage,
    OpId,
};

/// Terminal outcome of one queued operation
pub(crate) type Completion = (OpId, Result<(), Error>);

/// A message submitted but not yet written to a transport
#[derive(Debug)]
struct Unsent {
    message: ProtocolMessage,
    op: OpId,
    registered: Instant,
}

/// A message written to a transport and awaiting ACK or NACK
#[derive(Debug)]
pub(crate) struct PendingMessage {
    pub(crate) serial: u64,
    pub(crate) message: ProtocolMessage,
    pub(crate) op: OpId,
    pub(crate) registered: Instant,
    pub(crate) retry_count: u32,
}

/// Outbound messages requiring acknowledgement, in submission order
///
/// Serials are assigned when a message is handed to the transport, so the sequence the server
/// observes is gapless and strictly increasing. `in_flight` therefore always holds a contiguous
/// run of serials ending just below `next_serial`.
#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    unsent: VecDeque<Unsent>,
    in_flight: VecDeque<PendingMessage>,
    next_serial: u64,
}

impl MessageQueue {
    pub(crate) fn push(&mut self, message: ProtocolMessage, op: OpId, now: Instant) {
        debug_assert!(message.ack_required());
        self.unsent.push_back(Unsent {
            message,
            op,
            registered: now,
        });
    }

    /// Number of messages awaiting a terminal outcome
    pub(crate) fn len(&self) -> usize {
        self.unsent.len() + self.in_flight.len()
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Continue numbering from a recovered connection
    pub(crate) fn set_next_serial(&mut self, serial: u64) {
        debug_assert!(self.in_flight.is_empty());
        self.next_serial = serial;
    }

    /// Assign the next serial to the oldest unsent message and move it in flight
    pub(crate) fn next_transmit(&mut self) -> Option<ProtocolMessage> {
        let Unsent {
            mut message,
            op,
            registered,
        } = self.unsent.pop_front()?;
        let serial = self.next_serial;
        self.next_serial += 1;
        message.msg_serial = Some(serial);
        self.in_flight.push_back(PendingMessage {
            serial,
            message: message.clone(),
            op,
            registered,
            retry_count: 0,
        });
        Some(message)
    }

    /// Resolve the serial range `[base, base + count)`
    ///
    /// Serials below the oldest pending entry are late duplicates and ignored. Pending entries
    /// below `base` were skipped by the server and fail. A range reaching past the last assigned
    /// serial is a protocol violation and leaves the queue untouched.
    pub(crate) fn resolve(
        &mut self,
        base: u64,
        count: u64,
        outcome: Result<(), Error>,
        out: &mut Vec<Completion>,
    ) -> Result<(), Error> {
        let end = base.saturating_add(count);
        if end > self.next_serial {
            return Err(Error::protocol(format!(
                "acknowledgement for serials {base}..{end} but only {} assigned",
                self.next_serial
            )));
        }

        while let Some(front) = self.in_flight.front() {
            if front.serial >= end {
                break;
            }
            let Some(pending) = self.in_flight.pop_front() else {
                break;
            };
            let result = if pending.serial < base {
                Err(Error::Nack(ErrorInfo::new(
                    codes::INTERNAL,
                    500,
                    "message skipped by server acknowledgement",
                )))
            } else {
                outcome.clone()
            };
            trace!(serial = pending.serial, ok = result.is_ok(), "resolved");
            out.push((pending.op, result));
        }
        Ok(())
    }

    /// Messages to re-send after a resume, with their original serials
    ///
    /// Entries at or below `confirmed` stay pending for their acknowledgement; `None` replays
    /// every entry.
    pub(crate) fn replay(&mut self, confirmed: Option<u64>) -> Vec<ProtocolMessage> {
        self.in_flight
            .iter_mut()
            .filter(|p| confirmed.map_or(true, |c| p.serial > c))
            .map(|p| {
                p.retry_count += 1;
                trace!(
                    serial = p.serial,
                    retries = p.retry_count,
                    registered = ?p.registered,
                    "replaying"
                );
                p.message.clone()
            })
            .collect()
    }

    /// Fail every message that has been written to a transport and restart numbering
    pub(crate) fn fail_in_flight(&mut self, err: &Error, out: &mut Vec<Completion>) {
        out.extend(self.in_flight.drain(..).map(|p| (p.op, Err(err.clone()))));
        self.next_serial = 0;
    }

    /// Fail everything, oldest first
    pub(crate) fn fail_all(&mut self, err: &Error, out: &mut Vec<Completion>) {
        self.fail_in_flight(err, out);
        out.extend(self.unsent.drain(..).map(|u| (u.op, Err(err.clone()))));
    }

    /// Fail unsent messages addressed to `channel`
    pub(crate) fn fail_unsent_for(&mut self, channel: &str, err: &Error, out: &mut Vec<Completion>) {
        let mut kept = VecDeque::with_capacity(self.unsent.len());
        for unsent in self.unsent.drain(..) {
            if unsent.message.channel.as_deref() == Some(channel) {
                out.push((unsent.op, Err(err.clone())));
            } else {
                kept.push_back(unsent);
            }
        }
        self.unsent = kept;
    }

    /// Withdraw a message that has not been assigned a serial yet
    pub(crate) fn cancel(&mut self, op: OpId) -> bool {
        match self.unsent.iter().position(|u| u.op == op) {
            Some(i) => {
                self.unsent.remove(i);
                true
            }
            None => false,
        }
    }
}
