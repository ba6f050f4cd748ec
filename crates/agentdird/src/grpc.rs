//! gRPC services
//!
//! Thin adapters from the proto surface onto the record store, the routing
//! façade, and the publication pipeline. Error kinds map to fixed status
//! codes; List and Search are server-streaming.

use crate::proto;
use crate::publication::{PublicationRequest, PublicationService};
use agent_dir_core::query::{QueryType, RecordQuery};
use agent_dir_core::{codec, Error, RecordRef, Referrer};
use agent_dir_core::{REFERRER_TYPE_PUBLIC_KEY, REFERRER_TYPE_SIGNATURE};
use agent_dir_routing::Routing;
use agent_dir_store::RecordStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Map a directory error to its gRPC status code.
fn to_status(err: Error) -> Status {
    match err {
        Error::InvalidArgument(_) | Error::UnsupportedVersion(_) | Error::UnsupportedAlgorithm(_) => {
            Status::invalid_argument(err.to_string())
        }
        Error::NotFound(_) => Status::not_found(err.to_string()),
        Error::Integrity(_) | Error::BadRecord(_) => Status::failed_precondition(err.to_string()),
        Error::Cancelled => Status::cancelled(err.to_string()),
        Error::Timeout => Status::deadline_exceeded(err.to_string()),
        Error::Internal(_) => Status::internal(err.to_string()),
    }
}

fn query_from_proto(query: proto::RecordQuery) -> Result<RecordQuery, Status> {
    let query_type = match proto::RecordQueryType::try_from(query.r#type) {
        Ok(proto::RecordQueryType::Name) => QueryType::Name,
        Ok(proto::RecordQueryType::Version) => QueryType::Version,
        Ok(proto::RecordQueryType::Skill) => QueryType::Skill,
        Ok(proto::RecordQueryType::Locator) => QueryType::Locator,
        Ok(proto::RecordQueryType::Domain) => QueryType::Domain,
        Ok(proto::RecordQueryType::Module) => QueryType::Module,
        Ok(proto::RecordQueryType::Feature) => QueryType::Feature,
        Ok(proto::RecordQueryType::Unspecified) | Err(_) => {
            return Err(Status::invalid_argument("query type is unspecified"))
        }
    };
    Ok(RecordQuery::new(query_type, query.value))
}

fn query_to_proto(query: RecordQuery) -> proto::RecordQuery {
    let query_type = match query.query_type {
        QueryType::Name => proto::RecordQueryType::Name,
        QueryType::Version => proto::RecordQueryType::Version,
        QueryType::Skill => proto::RecordQueryType::Skill,
        QueryType::Locator => proto::RecordQueryType::Locator,
        QueryType::Domain => proto::RecordQueryType::Domain,
        QueryType::Module => proto::RecordQueryType::Module,
        QueryType::Feature => proto::RecordQueryType::Feature,
    };
    proto::RecordQuery {
        r#type: query_type as i32,
        value: query.value,
    }
}

fn queries_from_proto(queries: Vec<proto::RecordQuery>) -> Result<Vec<RecordQuery>, Status> {
    queries.into_iter().map(query_from_proto).collect()
}

fn referrer_from_proto(referrer: proto::Referrer) -> Referrer {
    Referrer {
        referrer_type: referrer.r#type,
        data: referrer.data,
        annotations: referrer.annotations.into_iter().collect(),
        created_at: referrer.created_at,
    }
}

fn referrer_to_proto(referrer: Referrer) -> proto::Referrer {
    proto::Referrer {
        r#type: referrer.referrer_type,
        data: referrer.data,
        annotations: referrer.annotations.into_iter().collect(),
        created_at: referrer.created_at,
    }
}

// =============================================================================
// STORE SERVICE
// =============================================================================

pub struct StoreService {
    store: Arc<dyn RecordStore>,
}

impl StoreService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl proto::store_server::Store for StoreService {
    async fn push(
        &self,
        request: Request<proto::Record>,
    ) -> Result<Response<proto::RecordRef>, Status> {
        let record = codec::unmarshal(&request.into_inner().data).map_err(to_status)?;
        let record_ref = self.store.push(&record).await.map_err(to_status)?;
        Ok(Response::new(proto::RecordRef {
            cid: record_ref.cid,
        }))
    }

    async fn pull(
        &self,
        request: Request<proto::RecordRef>,
    ) -> Result<Response<proto::Record>, Status> {
        let record_ref = RecordRef::new(request.into_inner().cid);
        let record = self.store.pull(&record_ref).await.map_err(to_status)?;
        let data = codec::marshal(&record).map_err(to_status)?;
        Ok(Response::new(proto::Record { data }))
    }

    async fn lookup(
        &self,
        request: Request<proto::RecordRef>,
    ) -> Result<Response<proto::RecordMeta>, Status> {
        let record_ref = RecordRef::new(request.into_inner().cid);
        let meta = self.store.lookup(&record_ref).await.map_err(to_status)?;
        Ok(Response::new(proto::RecordMeta {
            cid: meta.cid,
            schema_version: meta.schema_version,
            created_at: meta.created_at,
            annotations: meta.annotations.into_iter().collect(),
        }))
    }

    async fn delete(
        &self,
        request: Request<proto::RecordRef>,
    ) -> Result<Response<proto::Empty>, Status> {
        let record_ref = RecordRef::new(request.into_inner().cid);
        self.store.delete(&record_ref).await.map_err(to_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn push_referrer(
        &self,
        request: Request<proto::PushReferrerRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let request = request.into_inner();
        let referrer = request
            .referrer
            .ok_or_else(|| Status::invalid_argument("request has no referrer"))?;
        self.store
            .push_referrer(&request.cid, &referrer_from_proto(referrer))
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn pull_referrer(
        &self,
        request: Request<proto::PullReferrerRequest>,
    ) -> Result<Response<proto::PullReferrerResponse>, Status> {
        let request = request.into_inner();
        let type_filter = match request.selector {
            Some(proto::pull_referrer_request::Selector::PullSignature(true)) => {
                Some(REFERRER_TYPE_SIGNATURE)
            }
            Some(proto::pull_referrer_request::Selector::PullPublicKey(true)) => {
                Some(REFERRER_TYPE_PUBLIC_KEY)
            }
            _ => None,
        };

        let mut referrers = Vec::new();
        self.store
            .walk_referrers(&request.cid, type_filter, &mut |referrer| {
                referrers.push(referrer_to_proto(referrer));
                Ok(())
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::PullReferrerResponse { referrers }))
    }
}

// =============================================================================
// ROUTING SERVICE
// =============================================================================

pub struct RoutingService {
    routing: Arc<Routing>,
    publications: Arc<PublicationService>,
}

impl RoutingService {
    pub fn new(routing: Arc<Routing>, publications: Arc<PublicationService>) -> Self {
        Self {
            routing,
            publications,
        }
    }
}

#[tonic::async_trait]
impl proto::routing_server::Routing for RoutingService {
    async fn publish(
        &self,
        request: Request<proto::PublishRequest>,
    ) -> Result<Response<proto::PublishResponse>, Status> {
        let source = request
            .into_inner()
            .source
            .ok_or_else(|| Status::invalid_argument("publish request has no source"))?;

        let publication_request = match source {
            proto::publish_request::Source::RecordRefs(list) => {
                let refs: Vec<String> = list.refs.into_iter().map(|r| r.cid).collect();
                if refs.is_empty() || refs.iter().any(String::is_empty) {
                    return Err(Status::invalid_argument("publish request needs non-empty cids"));
                }
                PublicationRequest::Refs(refs)
            }
            proto::publish_request::Source::Queries(list) => {
                PublicationRequest::Queries(queries_from_proto(list.queries)?)
            }
        };

        let publication = self
            .publications
            .submit(publication_request)
            .map_err(to_status)?;
        Ok(Response::new(proto::PublishResponse {
            publication_id: publication.id,
        }))
    }

    async fn unpublish(
        &self,
        request: Request<proto::UnpublishRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let source = request
            .into_inner()
            .source
            .ok_or_else(|| Status::invalid_argument("unpublish request has no source"))?;

        let cids: Vec<String> = match source {
            proto::unpublish_request::Source::RecordRefs(list) => {
                let refs: Vec<String> = list.refs.into_iter().map(|r| r.cid).collect();
                if refs.is_empty() || refs.iter().any(String::is_empty) {
                    return Err(Status::invalid_argument(
                        "unpublish request needs non-empty cids",
                    ));
                }
                refs
            }
            proto::unpublish_request::Source::Queries(list) => {
                let queries = queries_from_proto(list.queries)?;
                self.routing
                    .list(&queries, None)
                    .map_err(to_status)?
                    .into_iter()
                    .map(|m| m.cid)
                    .collect()
            }
        };
        for cid in cids {
            self.routing.unpublish(&cid).await.map_err(to_status)?;
        }
        Ok(Response::new(proto::Empty {}))
    }

    type ListStream = ReceiverStream<Result<proto::ListResponse, Status>>;

    async fn list(
        &self,
        request: Request<proto::ListRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let request = request.into_inner();
        let queries = queries_from_proto(request.queries)?;
        let limit = request.limit.map(|l| l as usize);

        let matches = self.routing.list(&queries, limit).map_err(to_status)?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for m in matches {
                let response = proto::ListResponse {
                    record_ref: Some(proto::RecordRef { cid: m.cid }),
                    labels: m.labels,
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type SearchStream = ReceiverStream<Result<proto::SearchResponse, Status>>;

    async fn search(
        &self,
        request: Request<proto::SearchRequest>,
    ) -> Result<Response<Self::SearchStream>, Status> {
        let request = request.into_inner();
        let queries = queries_from_proto(request.queries)?;
        let limit = request.limit.map(|l| l as usize);
        // min_match_score 0 behaves as 1.
        let min_score = request.min_match_score.unwrap_or(1);

        let mut hits = self.routing.search(queries, limit, min_score);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(hit) = hits.recv().await {
                let response = proto::SearchResponse {
                    record_ref: Some(proto::RecordRef {
                        cid: hit.record_ref.cid,
                    }),
                    peer_id: hit.peer_id,
                    match_score: hit.match_score,
                    matched_queries: hit.matched_queries.into_iter().map(query_to_proto).collect(),
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
