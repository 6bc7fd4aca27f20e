//! First-of-two-events combinator.
//!
//! Two producers, one consumer: whichever future finishes first decides the
//! outcome and the other is dropped. Dropping a future does not stop a task
//! that feeds it; when the loser is backed by a spawned task the caller must
//! cancel or abort that task once `first_of` returns.

use std::future::Future;

/// Which of the two events arrived first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum First<L, R> {
    Left(L),
    Right(R),
}

/// Await both futures and return the first outcome
///
/// Polling is biased towards `left`: when both are ready in the same poll,
/// `left` wins.
pub async fn first_of<L, R>(left: L, right: R) -> First<L::Output, R::Output>
where
    L: Future,
    R: Future,
{
    tokio::select! {
        biased;
        out = left => First::Left(out),
        out = right => First::Right(out),
    }
}
