//! Peer discovery through the tracker service.
//!
//! The tracker maps digests to hostnames. `query` finds a peer holding an
//! object and remembers the `source` token it came with; `report`
//! announces this host after a successful fetch, echoing that token so the
//! tracker can maintain its distribution graph.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::Channel;
use tracing::instrument;
use url::Url;

use merklefs_castore::{CasDigest, Error};

use crate::proto::tracker_client::TrackerClient;
use crate::proto::{QueryRequest, ReportRequest};

/// Per-call deadline on tracker RPCs.
const RPC_DEADLINE: Duration = Duration::from_secs(1);

pub struct LocationClient {
    client: TrackerClient<Channel>,
    /// Name announced on report; no scheme, no port.
    hostname: String,
    /// Port peers serve their pool on, composed into peer URLs. Local
    /// configuration, never carried in tracker responses.
    port: Option<u16>,
    /// Source token observed on the last query per digest, echoed on the
    /// next report. Queries and reports interleave across requests, so
    /// access is serialized.
    sources: Mutex<HashMap<CasDigest, i64>>,
}

impl LocationClient {
    /// Creates a client for the tracker at `addr` (e.g.
    /// `http://tracker:2333`). The connection is established lazily on the
    /// first call.
    pub fn new(addr: &str, hostname: String, port: Option<u16>) -> Result<Self, Error> {
        let channel = tonic::transport::Endpoint::from_shared(addr.to_string())
            .map_err(|e| Error::Rpc(format!("tracker address {:?}: {}", addr, e)))?
            .connect_lazy();
        Ok(Self {
            client: TrackerClient::new(channel),
            hostname,
            port,
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Asks the tracker for a peer holding `digest`. `Ok(None)` means no
    /// peer is known yet and is not an error.
    #[instrument(skip(self), fields(object.digest = %digest), err)]
    pub async fn query(&self, digest: &CasDigest) -> Result<Option<Url>, Error> {
        let mut request = tonic::Request::new(QueryRequest {
            key: digest.to_string(),
        });
        request.set_timeout(RPC_DEADLINE);

        let mut client = self.client.clone();
        let reply = client
            .query(request)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?
            .into_inner();
        if reply.location.is_empty() {
            return Ok(None);
        }

        let authority = match self.port {
            Some(port) => format!("{}:{}", reply.location, port),
            None => reply.location.clone(),
        };
        let url = Url::parse(&format!("http://{}/{}", authority, digest))
            .map_err(|e| Error::Rpc(format!("peer location {:?}: {}", reply.location, e)))?;

        self.sources
            .lock()
            .map_err(|_| Error::Rpc("pending sources mutex poisoned".to_string()))?
            .insert(*digest, reply.source);
        Ok(Some(url))
    }

    /// Announces this host as a holder of `digest`, forwarding the source
    /// remembered from the preceding query. The memory is dropped once the
    /// tracker acknowledged.
    #[instrument(skip(self), fields(object.digest = %digest), err)]
    pub async fn report(&self, digest: &CasDigest) -> Result<(), Error> {
        let source = self
            .sources
            .lock()
            .map_err(|_| Error::Rpc("pending sources mutex poisoned".to_string()))?
            .get(digest)
            .copied()
            .unwrap_or(0);

        let mut request = tonic::Request::new(ReportRequest {
            key: digest.to_string(),
            location: self.hostname.clone(),
            source,
        });
        request.set_timeout(RPC_DEADLINE);

        let mut client = self.client.clone();
        client
            .report(request)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        self.sources
            .lock()
            .map_err(|_| Error::Rpc("pending sources mutex poisoned".to_string()))?
            .remove(digest);
        Ok(())
    }
}
