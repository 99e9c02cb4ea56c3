//! Non-blocking reads.
//!
//! A read on a node whose value is not yet known registers a one-shot slot on
//! the leaf and hands back a [`PendingGet`] future. The slot is fulfilled on the
//! tree's own thread when the first update arrives, in registration order.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Identifies a pending read for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GetTicket(pub(crate) u64);

/// Why a read did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GetError {
    /// The read was cancelled or its node was removed
    #[error("read cancelled")]
    Cancelled,

    /// The value did not decode as the requested type
    #[error("value decode failed: {0}")]
    Decode(String),
}

pub(crate) struct PendingSlot {
    pub(crate) ticket: GetTicket,
    pub(crate) sender: oneshot::Sender<Value>,
}

enum State {
    Ready(Option<Value>),
    Waiting(oneshot::Receiver<Value>),
}

/// A read that resolves once the leaf has a value.
pub struct PendingGet {
    ticket: Option<GetTicket>,
    state: State,
}

impl PendingGet {
    pub(crate) fn ready(value: Value) -> Self {
        Self {
            ticket: None,
            state: State::Ready(Some(value)),
        }
    }

    pub(crate) fn waiting(ticket: GetTicket) -> (Self, PendingSlot) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                ticket: Some(ticket),
                state: State::Waiting(receiver),
            },
            PendingSlot { ticket, sender },
        )
    }

    /// The cancellation ticket, `None` if the read resolved immediately.
    #[must_use]
    pub fn ticket(&self) -> Option<GetTicket> {
        self.ticket
    }

    /// Whether the value was available at call time.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// Take the result without waiting. `None` while still pending.
    pub fn try_take(&mut self) -> Option<Result<Value, GetError>> {
        match &mut self.state {
            State::Ready(value) => Some(value.take().ok_or(GetError::Cancelled)),
            State::Waiting(receiver) => match receiver.try_recv() {
                Ok(value) => Some(Ok(value)),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(GetError::Cancelled)),
            },
        }
    }

    /// Decode the resolved value as `T`.
    #[must_use]
    pub fn typed<T: DeserializeOwned>(self) -> TypedGet<T> {
        TypedGet {
            inner: self,
            _marker: PhantomData,
        }
    }
}

impl std::fmt::Debug for PendingGet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGet")
            .field("ticket", &self.ticket)
            .field("immediate", &self.is_immediate())
            .finish()
    }
}

impl Future for PendingGet {
    type Output = Result<Value, GetError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(value) => Poll::Ready(value.take().ok_or(GetError::Cancelled)),
            State::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|res| res.map_err(|_| GetError::Cancelled)),
        }
    }
}

/// A [`PendingGet`] decoding its value as `T`.
pub struct TypedGet<T> {
    inner: PendingGet,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedGet<T> {
    /// The cancellation ticket of the underlying read.
    #[must_use]
    pub fn ticket(&self) -> Option<GetTicket> {
        self.inner.ticket()
    }
}

impl<T: DeserializeOwned> Future for TypedGet<T> {
    type Output = Result<T, GetError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx).map(|res| {
            res.and_then(|value| {
                serde_json::from_value(value).map_err(|e| GetError::Decode(e.to_string()))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_resolves_once() {
        let mut get = PendingGet::ready(json!(5));
        assert!(get.is_immediate());
        assert_eq!(get.try_take(), Some(Ok(json!(5))));
        assert_eq!(get.try_take(), Some(Err(GetError::Cancelled)));
    }

    #[test]
    fn waiting_resolves_when_sent() {
        let (mut get, slot) = PendingGet::waiting(GetTicket(1));
        assert_eq!(get.ticket(), Some(GetTicket(1)));
        assert_eq!(get.try_take(), None);
        slot.sender.send(json!("hi")).unwrap();
        assert_eq!(get.try_take(), Some(Ok(json!("hi"))));
    }

    #[test]
    fn dropped_slot_cancels() {
        let (get, slot) = PendingGet::waiting(GetTicket(2));
        drop(slot);
        assert_eq!(tokio_test::block_on(get), Err(GetError::Cancelled));
    }

    #[test]
    fn typed_decode_failure() {
        let get = PendingGet::ready(json!("not a number")).typed::<i64>();
        assert!(matches!(tokio_test::block_on(get), Err(GetError::Decode(_))));
    }
}
