//! Per-peer connection arbitration ("crossed hellos").
//!
//! Two daemons may dial each other at the same moment. Each side keeps one
//! [`RemoteControl`] per remote node and feeds it every inbound (`accept`)
//! and outbound (`connect`) connection. Transitions are computed by
//! [`transition`] under the controller's lock and return the side effects
//! to run once the lock is released.
//!
//! The node with the larger id keeps its outbound connection (connect
//! bias); the smaller one drops its outbound connection in favor of the
//! inbound one (accept bias). Both sides therefore keep the same link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::NodeId;

use super::cancel::{CancelReason, CancelToken, bind_fates};
use super::sync::lock;

#[derive(Clone, Debug)]
pub struct Incarnation<G> {
    pub gateway: G,
    pub token: CancelToken,
}

#[derive(Clone, Debug)]
pub enum Phase<G> {
    Start,
    /// Holding a gateway from an inbound connection.
    Accepted(Incarnation<G>),
    /// Holding a gateway from our own outbound connection.
    Connected(Incarnation<G>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseKind {
    Start,
    Accepted,
    Connected,
}

impl<G> Phase<G> {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Start => PhaseKind::Start,
            Phase::Accepted(_) => PhaseKind::Accepted,
            Phase::Connected(_) => PhaseKind::Connected,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bias {
    /// Keep our outbound connection, refuse inbound ones.
    Connect,
    /// Drop our outbound connection for an inbound one.
    Accept,
}

impl Bias {
    pub fn between(local: &NodeId, remote: &NodeId) -> Bias {
        if local > remote {
            Bias::Connect
        } else {
            Bias::Accept
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControlState<G> {
    pub phase: Phase<G>,
    /// Bumped whenever a new incarnation takes ownership of the reset.
    pub epoch: u64,
}

pub enum Event<G> {
    Accept { gateway: G, token: CancelToken },
    Connect { candidate: G, token: CancelToken },
}

#[derive(Debug)]
pub enum Effect {
    /// Cancel a proposed connection we will not use.
    Refuse(CancelToken, &'static str),
    /// Cancel the connection we held until now.
    Abandon(CancelToken, &'static str),
    BindFates(CancelToken, CancelToken),
    /// Return to `Start` when the token fires, if the epoch still matches.
    ResetWhenCancelled(CancelToken, u64),
    /// Run the dialer for the candidate gateway that was just installed.
    Dial,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<G> {
    Accepted,
    Refused,
    /// Gateway to use for an outbound request.
    Gateway(G),
}

const ALREADY_ACCEPTED: &str = "already accepted a connection";
const CONNECT_BIAS: &str = "connection refused: already connected (crossed hellos, connect bias)";
const ACCEPT_BIAS: &str = "connection abandoned: accepted new connection (crossed hellos, accept bias)";

/// Pure transition function.
pub fn transition<G: Clone>(
    state: ControlState<G>,
    event: Event<G>,
    bias: Bias,
) -> (ControlState<G>, Vec<Effect>, Outcome<G>) {
    let ControlState { phase, epoch } = state;
    match (phase, event) {
        (Phase::Start, Event::Accept { gateway, token }) => {
            let epoch = epoch + 1;
            (
                ControlState {
                    phase: Phase::Accepted(Incarnation {
                        gateway,
                        token: token.clone(),
                    }),
                    epoch,
                },
                vec![Effect::ResetWhenCancelled(token, epoch)],
                Outcome::Accepted,
            )
        }
        (Phase::Start, Event::Connect { candidate, token }) => {
            let epoch = epoch + 1;
            (
                ControlState {
                    phase: Phase::Connected(Incarnation {
                        gateway: candidate.clone(),
                        token: token.clone(),
                    }),
                    epoch,
                },
                vec![Effect::ResetWhenCancelled(token, epoch), Effect::Dial],
                Outcome::Gateway(candidate),
            )
        }
        (Phase::Accepted(current), Event::Accept { token, .. }) => (
            ControlState {
                phase: Phase::Accepted(current),
                epoch,
            },
            vec![Effect::Refuse(token, ALREADY_ACCEPTED)],
            Outcome::Refused,
        ),
        (Phase::Accepted(current), Event::Connect { token, .. }) => {
            let gateway = current.gateway.clone();
            (
                ControlState {
                    phase: Phase::Accepted(Incarnation {
                        gateway: gateway.clone(),
                        token: token.clone(),
                    }),
                    epoch,
                },
                vec![Effect::BindFates(current.token, token)],
                Outcome::Gateway(gateway),
            )
        }
        (Phase::Connected(current), Event::Accept { gateway, token }) => match bias {
            Bias::Connect => (
                ControlState {
                    phase: Phase::Connected(current),
                    epoch,
                },
                vec![Effect::Refuse(token, CONNECT_BIAS)],
                Outcome::Refused,
            ),
            Bias::Accept => {
                let epoch = epoch + 1;
                (
                    ControlState {
                        phase: Phase::Accepted(Incarnation {
                            gateway,
                            token: token.clone(),
                        }),
                        epoch,
                    },
                    vec![
                        Effect::Abandon(current.token, ACCEPT_BIAS),
                        Effect::ResetWhenCancelled(token, epoch),
                    ],
                    Outcome::Accepted,
                )
            }
        },
        (Phase::Connected(current), Event::Connect { token, .. }) => {
            let gateway = current.gateway.clone();
            (
                ControlState {
                    phase: Phase::Connected(Incarnation {
                        gateway: gateway.clone(),
                        token: token.clone(),
                    }),
                    epoch,
                },
                vec![Effect::BindFates(current.token, token)],
                Outcome::Gateway(gateway),
            )
        }
    }
}

/// Arbitration for one remote node.
pub struct RemoteControl<G> {
    local: NodeId,
    remote: NodeId,
    state: Mutex<ControlState<G>>,
    this: Weak<RemoteControl<G>>,
}

impl<G: Clone + Send + 'static> RemoteControl<G> {
    pub fn new(local: NodeId, remote: NodeId) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            remote,
            state: Mutex::new(ControlState {
                phase: Phase::Start,
                epoch: 0,
            }),
            this: this.clone(),
        })
    }

    pub fn remote(&self) -> &NodeId {
        &self.remote
    }

    pub fn bias(&self) -> Bias {
        Bias::between(&self.local, &self.remote)
    }

    pub fn phase(&self) -> PhaseKind {
        lock(&self.state).phase.kind()
    }

    pub fn current_gateway(&self) -> Option<G> {
        match &lock(&self.state).phase {
            Phase::Start => None,
            Phase::Accepted(inc) | Phase::Connected(inc) => Some(inc.gateway.clone()),
        }
    }

    /// Offer an inbound connection's gateway. A refused connection has its
    /// token cancelled before this returns.
    pub fn accept(&self, gateway: G, token: &CancelToken) -> bool {
        let outcome = self.apply(
            Event::Accept {
                gateway,
                token: token.clone(),
            },
            || {},
        );
        matches!(outcome, Outcome::Accepted)
    }

    /// Obtain the gateway for an outbound incarnation. `candidate` is
    /// installed only from `Start`, in which case `dial` runs (after the
    /// lock is released) to make it usable; otherwise the held gateway is
    /// returned and the two incarnations share a fate.
    pub fn connect(&self, candidate: G, token: &CancelToken, dial: impl FnOnce()) -> G {
        let fallback = candidate.clone();
        match self.apply(
            Event::Connect {
                candidate,
                token: token.clone(),
            },
            dial,
        ) {
            Outcome::Gateway(gateway) => gateway,
            Outcome::Accepted | Outcome::Refused => fallback,
        }
    }

    fn apply(&self, event: Event<G>, dial: impl FnOnce()) -> Outcome<G> {
        let (effects, outcome) = {
            let mut guard = lock(&self.state);
            let before = guard.phase.kind();
            let current = guard.clone();
            let (next, effects, outcome) = transition(current, event, self.bias());
            tracing::debug!(
                remote = self.remote.short(),
                from = ?before,
                to = ?next.phase.kind(),
                epoch = next.epoch,
                "remote control transition"
            );
            *guard = next;
            (effects, outcome)
        };

        let mut dial = Some(dial);
        for effect in effects {
            match effect {
                Effect::Refuse(token, why) => {
                    tracing::info!(remote = self.remote.short(), "{why}");
                    token.cancel(CancelReason::refused(why));
                }
                Effect::Abandon(token, why) => {
                    tracing::info!(remote = self.remote.short(), "{why}");
                    token.cancel(CancelReason::refused(why));
                }
                Effect::BindFates(a, b) => bind_fates(&a, &b),
                Effect::ResetWhenCancelled(token, epoch) => {
                    let this = self.this.clone();
                    token.on_cancel(move |_| {
                        if let Some(this) = this.upgrade() {
                            this.reset_if(epoch);
                        }
                    });
                }
                Effect::Dial => {
                    if let Some(dial) = dial.take() {
                        dial();
                    }
                }
            }
        }
        outcome
    }

    fn reset_if(&self, epoch: u64) {
        let mut guard = lock(&self.state);
        if guard.epoch == epoch && !matches!(guard.phase, Phase::Start) {
            tracing::debug!(remote = self.remote.short(), epoch, "remote control reset");
            guard.phase = Phase::Start;
        }
    }
}

/// One [`RemoteControl`] per remote node, created on first use.
pub struct RemoteControlProvider<G> {
    local: NodeId,
    controls: Mutex<HashMap<NodeId, Arc<RemoteControl<G>>>>,
}

impl<G: Clone + Send + 'static> RemoteControlProvider<G> {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn provide(&self, remote: &NodeId) -> Arc<RemoteControl<G>> {
        let mut controls = lock(&self.controls);
        Arc::clone(
            controls
                .entry(remote.clone())
                .or_insert_with(|| RemoteControl::new(self.local.clone(), remote.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::ID_HEX_LEN;

    fn node(c: char) -> NodeId {
        NodeId::parse(&c.to_string().repeat(ID_HEX_LEN)).unwrap()
    }

    /// A link between two daemons: each end has its own token, and closing
    /// either end closes the other.
    struct Link {
        dialer_end: CancelToken,
        listener_end: CancelToken,
    }

    impl Link {
        fn new() -> Self {
            let link = Link {
                dialer_end: CancelToken::new(),
                listener_end: CancelToken::new(),
            };
            bind_fates(&link.dialer_end, &link.listener_end);
            link
        }
    }

    fn alive(token: &CancelToken) -> bool {
        !token.is_cancelled()
    }

    #[test]
    fn start_accept_then_second_accept_is_refused() {
        let control = RemoteControl::new(node('1'), node('2'));
        let first = CancelToken::new();
        let second = CancelToken::new();
        assert!(control.accept("first", &first));
        assert!(!control.accept("second", &second));
        assert!(second.is_cancelled());
        assert_eq!(control.current_gateway(), Some("first"));

        first.cancel(CancelReason::closed("dropped"));
        assert_eq!(control.phase(), PhaseKind::Start);
    }

    #[test]
    fn connect_dials_only_from_start() {
        let control = RemoteControl::new(node('1'), node('2'));
        let mut dialed = 0;
        let a = CancelToken::new();
        assert_eq!(control.connect("a", &a, || dialed += 1), "a");
        let b = CancelToken::new();
        assert_eq!(control.connect("b", &b, || dialed += 1), "a");
        assert_eq!(dialed, 1);

        b.cancel(CancelReason::requested("incarnation done"));
        assert!(a.is_cancelled());
        assert_eq!(control.phase(), PhaseKind::Start);
    }

    #[test]
    fn crossed_hellos_accepts_before_remote_refusal() {
        // `low` < `high`: low has accept bias, high has connect bias.
        let low = RemoteControl::new(node('1'), node('9'));
        let high = RemoteControl::new(node('9'), node('1'));
        let from_low = Link::new();
        let from_high = Link::new();

        low.connect("low->high", &from_low.dialer_end, || {});
        high.connect("high->low", &from_high.dialer_end, || {});

        // low sees high's hello first: abandons its own outbound link.
        assert!(low.accept("high->low", &from_high.listener_end));
        // high then sees low's (already abandoned) hello and refuses it.
        assert!(!high.accept("low->high", &from_low.listener_end));

        assert!(!alive(&from_low.dialer_end));
        assert!(alive(&from_high.dialer_end));
        assert_eq!(low.phase(), PhaseKind::Accepted);
        assert_eq!(high.phase(), PhaseKind::Connected);
        assert_eq!(low.current_gateway(), Some("high->low"));
        assert_eq!(high.current_gateway(), Some("high->low"));
    }

    #[test]
    fn crossed_hellos_refusal_before_accept() {
        let low = RemoteControl::new(node('1'), node('9'));
        let high = RemoteControl::new(node('9'), node('1'));
        let from_low = Link::new();
        let from_high = Link::new();

        low.connect("low->high", &from_low.dialer_end, || {});
        high.connect("high->low", &from_high.dialer_end, || {});

        // high refuses low's hello; the refusal closes low's outbound link
        // and low falls back to Start.
        assert!(!high.accept("low->high", &from_low.listener_end));
        assert_eq!(low.phase(), PhaseKind::Start);
        assert!(low.accept("high->low", &from_high.listener_end));

        assert!(alive(&from_high.dialer_end));
        assert_eq!(low.current_gateway(), Some("high->low"));
        assert_eq!(high.current_gateway(), Some("high->low"));
    }

    #[test]
    fn abandoned_outbound_does_not_reset_adopted_inbound() {
        let low = RemoteControl::new(node('1'), node('9'));
        let outbound = CancelToken::new();
        let inbound = CancelToken::new();
        low.connect("out", &outbound, || {});
        assert!(low.accept("in", &inbound));
        assert!(outbound.is_cancelled());
        assert_eq!(low.phase(), PhaseKind::Accepted);

        inbound.cancel(CancelReason::closed("peer left"));
        assert_eq!(low.phase(), PhaseKind::Start);
    }

    #[test]
    fn provider_returns_singletons() {
        let provider: RemoteControlProvider<&'static str> = RemoteControlProvider::new(node('1'));
        let a = provider.provide(&node('2'));
        let b = provider.provide(&node('2'));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &provider.provide(&node('3'))));
    }
}
