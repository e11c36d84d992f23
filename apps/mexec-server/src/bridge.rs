use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mexec_events::{Bus, Consumer, DeliveryError, Event, EventKind, SubscriptionId};
use tracing::debug;

use crate::tunnel::{Tunnel, TunnelError};

/// Event kinds every tunnel is subscribed to.
pub(crate) const BRIDGED_KINDS: [EventKind; 2] = [EventKind::ExecError, EventKind::ExecExit];

/// Forwards bus events to one tunnel as JSON-RPC notifications.
struct ExecEventConsumer {
    tunnel: Weak<Tunnel>,
}

#[async_trait]
impl Consumer for ExecEventConsumer {
    async fn accept(&self, event: Event) -> Result<(), DeliveryError> {
        let tunnel = self.tunnel.upgrade().ok_or(DeliveryError::Closed)?;
        // nothing may precede the `connected` handshake on the wire
        tunnel.greeted().await;
        tunnel
            .send_notification(event.kind.as_str(), event.payload)
            .await
            .map_err(|err| match err {
                TunnelError::Closed => DeliveryError::Closed,
                other => DeliveryError::Failed(other.to_string()),
            })
    }
}

/// Subscription of one tunnel on the bus; removed when the tunnel closes.
pub(crate) struct EventBridge {
    bus: Bus,
    subscription: SubscriptionId,
    detached: AtomicBool,
}

impl EventBridge {
    pub fn attach(bus: &Bus, tunnel: &Arc<Tunnel>) -> Arc<Self> {
        let consumer = Arc::new(ExecEventConsumer {
            tunnel: Arc::downgrade(tunnel),
        });
        let subscription = bus.subscribe_any(consumer, &BRIDGED_KINDS);
        let bridge = Arc::new(Self {
            bus: bus.clone(),
            subscription,
            detached: AtomicBool::new(false),
        });
        let on_close = bridge.clone();
        tunnel.on_close(move || on_close.detach());
        debug!(tunnel = %tunnel.id(), subscription = %subscription, "event bridge attached");
        bridge
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bus.unsubscribe(self.subscription);
        debug!(subscription = %self.subscription, "event bridge detached");
    }
}
