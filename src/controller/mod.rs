//! Connection / authorization state machine.
//!
//! The [`KeychainController`] serves every keychain method for one
//! embedding origin at a time. Session-granting methods consult the
//! [`SessionRegistry`] first and only fall back to a [`ConsentPrompt`] when
//! no matching, unexpired grant exists. Errors stay typed
//! ([`KeychainError`]) until [`RequestHandler::handle`] turns each outcome
//! into exactly one resolve or reject.

mod consent;
mod request;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, watch};

use crate::callback::{
    CallbackClient, DEFAULT_REDIRECT_QUERY, SessionCallbackPayload, redirect_url,
};
use crate::channel::{ConnectionContext, Origin, RequestHandler, RequestPayload};
use crate::config::SessionConfig;
use crate::error::{GatewayError, KeychainError};
use crate::gateway::{ExecutionGateway, SessionGrant};
use crate::policy::{Call, PolicySet, merkle_root};
use crate::session::{
    ActiveSession, Session, SessionRegistry, metadata_hash, session_key_guid,
};

pub use self::consent::{
    Approval, ConsentDecision, ConsentKind, ConsentPrompt, ConsentRequest, HeadlessConsent,
    TerminalConsent, View,
};
pub use self::request::{
    ConnectParams, ExecuteParams, KeychainRequest, RegisterParams, SetDelegateParams,
    SignMessageParams,
};

/// Where the keychain stands with the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Idle,
    AwaitingConsent,
    Authorized,
    /// A session existed but its expiry passed.
    Expired,
    /// The user logged out.
    Revoked,
}

/// How a session request was satisfied.
struct Grant {
    session: Session,
    already_registered: bool,
}

pub struct KeychainController {
    registry: Arc<SessionRegistry>,
    gateway: ExecutionGateway,
    consent: Arc<dyn ConsentPrompt>,
    callbacks: CallbackClient,
    config: SessionConfig,
    state: watch::Sender<AuthorizationState>,
    /// One consent prompt at a time; later requests queue here.
    prompt_queue: Mutex<()>,
}

impl KeychainController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: ExecutionGateway,
        consent: Arc<dyn ConsentPrompt>,
        callbacks: CallbackClient,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthorizationState::Idle);
        Self {
            registry,
            gateway,
            consent,
            callbacks,
            config,
            state,
            prompt_queue: Mutex::new(()),
        }
    }

    pub fn state(&self) -> AuthorizationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorizationState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn set_state(&self, next: AuthorizationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Authorization state changed");
        }
    }

    /// Serve one request from `origin`.
    pub async fn dispatch(
        &self,
        origin: &Origin,
        request: KeychainRequest,
    ) -> Result<serde_json::Value, KeychainError> {
        tracing::debug!(%origin, method = request.method(), "Dispatching keychain request");
        match request {
            KeychainRequest::Connect(params) => self.connect(origin, params).await,
            KeychainRequest::Register(params) => self.register(origin, params).await,
            KeychainRequest::Probe => self.probe(origin).await,
            KeychainRequest::Execute(params) => self.execute(origin, params).await,
            KeychainRequest::SignMessage(params) => self.sign_message(origin, params).await,
            KeychainRequest::DeployContract => self.deploy_contract(origin).await,
            KeychainRequest::Logout => self.logout().await,
            KeychainRequest::OpenSettings => self.open_view(View::Settings).await,
            KeychainRequest::OpenMenu => self.open_view(View::Menu).await,
            KeychainRequest::SetDelegate(params) => self.set_delegate(origin, params).await,
        }
    }

    async fn connect(
        &self,
        origin: &Origin,
        params: ConnectParams,
    ) -> Result<serde_json::Value, KeychainError> {
        let public_key = match params.public_key {
            Some(key) => key,
            None => self
                .gateway
                .provider()
                .session_public_key()
                .await
                .map_err(GatewayError::Account)?,
        };
        let grant = self
            .grant_session(origin, &public_key, params.policies.into(), false)
            .await?;
        to_json(&SessionCallbackPayload::from_session(
            &grant.session,
            grant.already_registered,
        ))
    }

    async fn register(
        &self,
        origin: &Origin,
        params: RegisterParams,
    ) -> Result<serde_json::Value, KeychainError> {
        // Reject unusable callback targets before bothering the user.
        if let Some(uri) = params.callback_uri.as_deref() {
            self.callbacks.check(uri)?;
        }
        if let Some(uri) = params.redirect_uri.as_deref() {
            self.callbacks.check(uri)?;
        }

        let grant = self
            .grant_session(origin, &params.public_key, params.policies.into(), true)
            .await?;
        let payload = SessionCallbackPayload::from_session(&grant.session, grant.already_registered);

        let mut response = to_json(&payload)?;
        if let Some(uri) = params.redirect_uri.as_deref() {
            let query = params
                .redirect_query_name
                .as_deref()
                .unwrap_or(DEFAULT_REDIRECT_QUERY);
            response["redirectUrl"] = json!(redirect_url(uri, query, &payload)?);
        }
        if let Some(uri) = params.callback_uri.as_deref() {
            // The session stands even when the callback cannot be delivered.
            match self.callbacks.post_callback(uri, &payload).await {
                Ok(()) => response["callbackDelivered"] = json!(true),
                Err(e) => {
                    tracing::warn!(callback_uri = uri, error = %e, "Session callback failed");
                    response["callbackDelivered"] = json!(false);
                    response["callbackError"] = json!(e.to_string());
                }
            }
        }
        Ok(response)
    }

    async fn probe(&self, origin: &Origin) -> Result<serde_json::Value, KeychainError> {
        match self.registry.active_status().await? {
            ActiveSession::Live(session) if session.origin == *origin => {
                self.set_state(AuthorizationState::Authorized);
                to_json(&SessionCallbackPayload::from_session(&session, true))
            }
            ActiveSession::Expired(_) => {
                self.set_state(AuthorizationState::Expired);
                Ok(serde_json::Value::Null)
            }
            ActiveSession::Live(_) | ActiveSession::None => Ok(serde_json::Value::Null),
        }
    }

    async fn execute(
        &self,
        origin: &Origin,
        params: ExecuteParams,
    ) -> Result<serde_json::Value, KeychainError> {
        let result = match self.session_for(origin).await? {
            Some(session) => {
                self.gateway
                    .execute(&session, &params.calls, params.max_fee)
                    .await?
            }
            None => {
                let approval = self
                    .one_off_consent(
                        origin,
                        ConsentKind::Execute {
                            calls: params.calls.clone(),
                            max_fee: params.max_fee,
                        },
                    )
                    .await?;
                self.gateway
                    .execute_unchecked(&params.calls, approval.max_fee.or(params.max_fee))
                    .await?
            }
        };
        to_json(&result)
    }

    async fn sign_message(
        &self,
        origin: &Origin,
        params: SignMessageParams,
    ) -> Result<serde_json::Value, KeychainError> {
        let signature = match self.session_for(origin).await? {
            Some(session) => {
                self.gateway
                    .sign_message(&session, &params.typed_data)
                    .await?
            }
            None => {
                self.one_off_consent(
                    origin,
                    ConsentKind::SignMessage {
                        typed_data: params.typed_data.clone(),
                    },
                )
                .await?;
                self.gateway.sign_unchecked(&params.typed_data).await?
            }
        };
        to_json(&signature)
    }

    async fn deploy_contract(&self, origin: &Origin) -> Result<serde_json::Value, KeychainError> {
        self.one_off_consent(origin, ConsentKind::DeployContract)
            .await?;
        let result = self
            .gateway
            .provider()
            .deploy()
            .await
            .map_err(GatewayError::Deployment)?;
        tracing::info!(transaction_hash = %result.transaction_hash, "Account deployment submitted");
        to_json(&result)
    }

    async fn set_delegate(
        &self,
        origin: &Origin,
        params: SetDelegateParams,
    ) -> Result<serde_json::Value, KeychainError> {
        let account = self
            .gateway
            .provider()
            .account()
            .await
            .map_err(GatewayError::Account)?;
        self.one_off_consent(
            origin,
            ConsentKind::SetDelegate {
                delegate: params.delegate_address.clone(),
            },
        )
        .await?;

        let call = Call {
            contract_address: account.address,
            entrypoint: "set_delegate_account".to_string(),
            calldata: vec![params.delegate_address.to_string()],
        };
        let result = self.gateway.execute_unchecked(&[call], None).await?;
        to_json(&result)
    }

    async fn logout(&self) -> Result<serde_json::Value, KeychainError> {
        match self.registry.active_status().await? {
            ActiveSession::Live(session) | ActiveSession::Expired(session) => {
                self.registry.invalidate(&session.public_key).await?;
            }
            ActiveSession::None => {}
        }
        self.registry.clear().await?;
        self.set_state(AuthorizationState::Revoked);
        Ok(serde_json::Value::Null)
    }

    async fn open_view(&self, view: View) -> Result<serde_json::Value, KeychainError> {
        self.consent.open_view(view).await?;
        Ok(serde_json::Value::Null)
    }

    /// The live session granted to `origin`, noting expiry on the way.
    async fn session_for(&self, origin: &Origin) -> Result<Option<Session>, KeychainError> {
        match self.registry.active_status().await? {
            ActiveSession::Live(session) if session.origin == *origin => Ok(Some(session)),
            ActiveSession::Live(session) => {
                tracing::debug!(
                    %origin,
                    granted_to = %session.origin,
                    "Active session belongs to another origin"
                );
                Ok(None)
            }
            ActiveSession::Expired(session) => {
                tracing::info!(public_key = %session.public_key, "Active session expired");
                self.set_state(AuthorizationState::Expired);
                Ok(None)
            }
            ActiveSession::None => Ok(None),
        }
    }

    /// Find or create a session for `public_key` covering `requested`.
    async fn grant_session(
        &self,
        origin: &Origin,
        public_key: &str,
        requested: PolicySet,
        register: bool,
    ) -> Result<Grant, KeychainError> {
        let fingerprint = requested.fingerprint()?;
        if let Some(grant) = self.existing_grant(origin, public_key, &fingerprint).await? {
            return Ok(grant);
        }

        let _turn = self.prompt_queue.lock().await;
        // An earlier prompt may have granted exactly this while we waited.
        if let Some(grant) = self.existing_grant(origin, public_key, &fingerprint).await? {
            return Ok(grant);
        }

        self.set_state(AuthorizationState::AwaitingConsent);
        let request = ConsentRequest {
            origin: origin.clone(),
            kind: ConsentKind::Session {
                policies: requested.normalize(),
                register,
            },
        };
        let approval = match self.consent.request_consent(&request).await {
            ConsentDecision::Approve(approval) => approval,
            ConsentDecision::Cancel => {
                self.set_state(AuthorizationState::Idle);
                tracing::info!(%origin, "Session consent canceled");
                return Err(KeychainError::Canceled);
            }
            ConsentDecision::Unavailable => {
                self.set_state(AuthorizationState::Idle);
                return Err(KeychainError::InteractionRequired(
                    "session consent requires the user".to_string(),
                ));
            }
        };

        match self
            .create_session(origin, public_key, &requested, fingerprint, approval, register)
            .await
        {
            Ok(session) => {
                self.set_state(AuthorizationState::Authorized);
                Ok(Grant {
                    session,
                    already_registered: false,
                })
            }
            Err(e) => {
                self.set_state(AuthorizationState::Idle);
                Err(e)
            }
        }
    }

    async fn existing_grant(
        &self,
        origin: &Origin,
        public_key: &str,
        fingerprint: &str,
    ) -> Result<Option<Grant>, KeychainError> {
        match self.registry.lookup(public_key, fingerprint).await? {
            Some(session) if session.origin == *origin => {
                tracing::info!(%origin, public_key, "Session already registered");
                self.set_state(AuthorizationState::Authorized);
                Ok(Some(Grant {
                    session,
                    already_registered: true,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn create_session(
        &self,
        origin: &Origin,
        public_key: &str,
        requested: &PolicySet,
        fingerprint: String,
        approval: Approval,
        register: bool,
    ) -> Result<Session, KeychainError> {
        let account = self
            .gateway
            .provider()
            .account()
            .await
            .map_err(GatewayError::Account)?;
        self.registry.save_account(&account).await?;

        let granted = match approval.policies {
            Some(ref edited) => requested.with_toggles(edited),
            None => requested.normalize(),
        };
        let policies = granted.authorized_only().policies;
        let allowed_policies_root = merkle_root(&policies)?;

        let now = self.registry.now();
        let ttl = approval
            .duration
            .unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl);

        let mut session = Session {
            public_key: public_key.to_string(),
            address: account.address,
            username: account.username,
            owner_guid: account.owner_guid,
            origin: origin.clone(),
            policy_fingerprint: fingerprint,
            allowed_policies_root,
            policies,
            expires_at: now.saturating_add(ttl.as_secs()),
            session_key_guid: session_key_guid(public_key),
            guardian_key_guid: self.config.guardian_guid.clone(),
            metadata_hash: metadata_hash(origin, requested.verified)?,
            max_fee: approval.max_fee.or(self.config.default_max_fee),
            transaction_hash: None,
            created_at: now,
        };

        if register {
            let grant = SessionGrant {
                public_key: session.public_key.clone(),
                expires_at: session.expires_at,
                allowed_policies_root: session.allowed_policies_root.clone(),
                metadata_hash: session.metadata_hash.clone(),
                session_key_guid: session.session_key_guid.clone(),
                guardian_key_guid: session.guardian_key_guid.clone(),
                policies: session.policies.clone(),
            };
            let registered = self
                .gateway
                .provider()
                .register_session(&grant)
                .await
                .map_err(GatewayError::Registration)?;
            session.transaction_hash = Some(registered.transaction_hash);
        }

        self.registry.insert(&session, requested).await?;
        Ok(session)
    }

    /// Ask for a single action outside any session. The state returns to
    /// what it was once the prompt is answered, unless it moved on.
    async fn one_off_consent(
        &self,
        origin: &Origin,
        kind: ConsentKind,
    ) -> Result<Approval, KeychainError> {
        let _turn = self.prompt_queue.lock().await;
        let previous = self.state();
        self.set_state(AuthorizationState::AwaitingConsent);

        let decision = self
            .consent
            .request_consent(&ConsentRequest {
                origin: origin.clone(),
                kind,
            })
            .await;
        // Leave any state another request set meanwhile (e.g. a logout).
        self.state.send_if_modified(|state| {
            if *state == AuthorizationState::AwaitingConsent {
                *state = previous;
                true
            } else {
                false
            }
        });

        match decision {
            ConsentDecision::Approve(approval) => Ok(approval),
            ConsentDecision::Cancel => Err(KeychainError::Canceled),
            ConsentDecision::Unavailable => Err(KeychainError::InteractionRequired(
                "manual approval requires the user".to_string(),
            )),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, KeychainError> {
    serde_json::to_value(value).map_err(|e| KeychainError::InvalidRequest(e.to_string()))
}

#[async_trait]
impl RequestHandler for KeychainController {
    async fn handle(&self, request: RequestPayload, ctx: ConnectionContext) {
        let outcome = match KeychainRequest::parse(&request.method, request.params) {
            Ok(parsed) => self.dispatch(ctx.origin(), parsed).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => {
                ctx.resolve(result);
            }
            Err(e) => {
                tracing::debug!(method = %request.method, origin = %ctx.origin(), error = %e, "Request failed");
                ctx.reject(e.to_wire());
            }
        }
    }
}
