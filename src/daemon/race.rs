//! First-settled-wins over heterogeneous channels, with an optional deadline.
//!
//! Losers that registered a token have it cancelled once the race is decided.
//! When the deadline wins, every entrant's token is cancelled.

use std::fmt::Display;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Select, SelectedOperation};

use super::cancel::{CancelReason, CancelToken};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settled {
    Fulfilled,
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finish<L> {
    pub label: L,
    pub settled: Settled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Elapsed {
    pub after: Duration,
}

/// Something a race can wait on.
pub trait Entrant {
    fn register<'a>(&'a self, select: &mut Select<'a>) -> usize;
    fn settle(&self, oper: SelectedOperation<'_>) -> Settled;
}

impl<T, E: Display> Entrant for Receiver<Result<T, E>> {
    fn register<'a>(&'a self, select: &mut Select<'a>) -> usize {
        select.recv(self)
    }

    fn settle(&self, oper: SelectedOperation<'_>) -> Settled {
        match oper.recv(self) {
            Ok(Ok(_)) => Settled::Fulfilled,
            Ok(Err(err)) => Settled::Rejected(err.to_string()),
            Err(_) => Settled::Rejected("sender dropped".into()),
        }
    }
}

/// A cancellation signal entrant: fulfilled when the token fires.
impl Entrant for Receiver<CancelReason> {
    fn register<'a>(&'a self, select: &mut Select<'a>) -> usize {
        select.recv(self)
    }

    fn settle(&self, oper: SelectedOperation<'_>) -> Settled {
        match oper.recv(self) {
            Ok(_) => Settled::Fulfilled,
            Err(_) => Settled::Rejected("token dropped".into()),
        }
    }
}

struct Lane<'a, L> {
    label: L,
    entrant: Box<dyn Entrant + 'a>,
    on_loss: Option<CancelToken>,
}

pub struct Race<'a, L> {
    lanes: Vec<Lane<'a, L>>,
    deadline: Option<(Instant, Duration)>,
}

impl<L> Default for Race<'_, L> {
    fn default() -> Self {
        Self {
            lanes: Vec::new(),
            deadline: None,
        }
    }
}

impl<'a, L: Clone> Race<'a, L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(mut self, label: L, entrant: impl Entrant + 'a) -> Self {
        self.lanes.push(Lane {
            label,
            entrant: Box::new(entrant),
            on_loss: None,
        });
        self
    }

    /// Like [`Race::enter`], cancelling `token` if this entrant does not win.
    pub fn enter_cancelling(
        mut self,
        label: L,
        entrant: impl Entrant + 'a,
        token: CancelToken,
    ) -> Self {
        self.lanes.push(Lane {
            label,
            entrant: Box::new(entrant),
            on_loss: Some(token),
        });
        self
    }

    pub fn deadline(mut self, after: Duration) -> Self {
        self.deadline = Some((Instant::now() + after, after));
        self
    }

    pub fn run(self) -> Result<Finish<L>, Elapsed> {
        let timer = self.deadline.map(|(at, _)| channel::at(at));
        let mut select = Select::new();
        let indices: Vec<usize> = self
            .lanes
            .iter()
            .map(|lane| lane.entrant.register(&mut select))
            .collect();
        let timer_index = timer.as_ref().map(|timer| select.recv(timer));

        let oper = select.select();
        let index = oper.index();

        if let (Some(timer_index), Some(timer)) = (timer_index, timer.as_ref())
            && index == timer_index
        {
            let _ = oper.recv(timer);
            let after = self.deadline.map(|(_, after)| after).unwrap_or_default();
            let reason = CancelReason::timeout(format!("race deadline of {after:?} elapsed"));
            for lane in &self.lanes {
                if let Some(token) = &lane.on_loss {
                    token.cancel(reason.clone());
                }
            }
            return Err(Elapsed { after });
        }

        let winner = indices
            .iter()
            .position(|candidate| *candidate == index)
            .unwrap_or_default();
        let settled = self.lanes[winner].entrant.settle(oper);
        for (position, lane) in self.lanes.iter().enumerate() {
            if position == winner {
                continue;
            }
            if let Some(token) = &lane.on_loss {
                token.cancel(CancelReason::requested("lost race"));
            }
        }
        Ok(Finish {
            label: self.lanes[winner].label.clone(),
            settled,
        })
    }
}
