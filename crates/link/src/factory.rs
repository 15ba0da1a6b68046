//! Builds contexts from topology descriptors.

use std::sync::Arc;

use corelib::envelope::max_frame_size;
use corelib::error::{Error, Result};
use corelib::network::{Transport, TransportOptions};
use corelib::topology::TopologyDescriptor;
use corelib::Rank;
use tracing::{debug, info, instrument};

use crate::channel::{Channel, ChannelOptions};
use crate::context::Context;
use crate::receiver::ReceiverLoop;

/// Creates [`Context`]s.
///
/// By default the backend follows the descriptor's transport protocol. A
/// factory built with [`with_transport`](Self::with_transport) uses the given
/// backend for every context instead, which is how in-process meshes are
/// wired.
#[derive(Clone, Default)]
pub struct ContextFactory {
    transport: Option<Arc<dyn Transport>>,
}

impl ContextFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    /// Validates `desc` for `self_rank`, wires one channel per peer and starts
    /// the receiver loop on the local party's host.
    ///
    /// TLS material is loaded up front, so unreadable files fail here as
    /// configuration errors. On error nothing is left behind: no channel
    /// exists and no listener is bound.
    #[instrument(skip(self, desc), fields(id = %desc.id, world_size = desc.world_size()))]
    pub async fn create_context(
        &self,
        desc: &TopologyDescriptor,
        self_rank: Rank,
    ) -> Result<Context> {
        let settings = desc.validate(self_rank)?;
        if let Some(tls) = &settings.tls {
            streaming::tls::check_material(tls)
                .map_err(|e| Error::Config(format!("unusable TLS material: {e}")))?;
        }
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => streaming::transport_for(settings.protocol),
        };

        let options = ChannelOptions::from_settings(&settings);
        let client_tls = settings.tls.as_ref().map(|tls| tls.client.clone());
        let mut receiver = ReceiverLoop::new(self_rank, settings.world_size, Arc::clone(&transport));
        let mut channels = Vec::with_capacity(settings.world_size);
        for party in &desc.parties {
            if party.rank == self_rank {
                channels.push(None);
                continue;
            }
            let mut channel = Channel::new(
                self_rank,
                party.rank,
                options.clone(),
                Arc::clone(&transport),
            );
            channel.set_peer_host(party.host.clone(), client_tls.clone());
            channel.set_throttle_window_size(settings.throttle_window);
            let channel = Arc::new(channel);
            receiver.add_listener(party.rank, &channel)?;
            debug!(peer = party.rank, host = %party.host, "channel created");
            channels.push(Some(channel));
        }

        let listen_opts = TransportOptions {
            connect_timeout: settings.connect_timeout,
            max_frame_size: max_frame_size(settings.payload_limit),
            stream_window: settings.stream_window,
            tls: settings.tls.as_ref().map(|tls| tls.server.clone()),
        };
        let local_host = &desc.parties[self_rank].host;
        let local_addr = receiver.start(local_host, listen_opts).await?;

        info!(
            rank = self_rank,
            addr = %local_addr,
            protocol = %settings.protocol,
            payload_limit = settings.payload_limit,
            "context created"
        );
        Ok(Context::new(
            settings,
            desc.parties.clone(),
            channels,
            receiver,
            local_addr,
        ))
    }
}
