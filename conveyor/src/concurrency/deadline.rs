//! Timer racing a transform against its deadlines.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

pin_project! {
    /// Sleeps until the earliest of several optional deadlines, or forever when none is set.
    ///
    /// A task may carry its own deadline and its stage may impose a timeout; the worker selects
    /// on a single timer covering both.
    #[derive(Debug)]
    pub struct DeadlineTimer {
        #[pin]
        sleep: Option<Sleep>,
    }
}

impl DeadlineTimer {
    pub fn earliest<D>(deadlines: D) -> Self
    where
        D: IntoIterator<Item = Option<Instant>>,
    {
        let deadline = deadlines.into_iter().flatten().min();

        Self {
            sleep: deadline.map(sleep_until),
        }
    }

    /// Returns the instant the timer fires at, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.sleep.as_ref().map(Sleep::deadline)
    }
}

impl Future for DeadlineTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.project().sleep.as_pin_mut() {
            Some(sleep) => sleep.poll(cx),
            None => Poll::Pending,
        }
    }
}
