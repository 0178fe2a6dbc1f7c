//! Per-lobby round state machine.
//!
//! Every lobby runs as one tokio task draining a [`LobbyEvent`] channel, so
//! joins, guesses, disconnects and timer firings for a lobby are applied
//! one at a time in arrival order. Timers never touch state themselves:
//! they post [`LobbyEvent::Timer`] back into the same channel, and only the
//! most recently armed timer id is honoured.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use pinpoint_core::catalog::{LocationCatalog, pick_target};
use pinpoint_core::error::GameError;
use pinpoint_core::lobby::{Lobby, LobbyId, LobbyState};
use pinpoint_core::net::messages::{
    GameFinishedMsg, GameStartingMsg, GuessAcceptedMsg, LobbySnapshotMsg, PlayerGuessedMsg,
    PresenceChange, PresenceMsg, RoundResultMsg, RoundStartedMsg, ServerMessage,
};
use pinpoint_core::player::{ConnectionStatus, UserId};
use pinpoint_core::round::{Coordinates, GameOutcome, GameSummary, Round, RoundSummary};
use pinpoint_core::scoring::leaderboard;
use pinpoint_core::time::now_ms;

use crate::persistence::ResultStore;
use crate::registry::LobbyRegistry;
use crate::retry::{RetryPolicy, with_backoff};
use crate::transport::{BroadcastTransport, ConnectionId};

type Reply<T = ()> = oneshot::Sender<Result<T, GameError>>;

/// Input to a lobby actor.
#[derive(Debug)]
pub enum LobbyEvent {
    Start {
        user_id: UserId,
        reply: Reply,
    },
    Abort {
        user_id: UserId,
        reply: Reply,
    },
    SubmitGuess {
        user_id: UserId,
        connection_id: ConnectionId,
        round: u32,
        coordinates: Coordinates,
        reply: Reply,
    },
    Heartbeat {
        user_id: UserId,
    },
    ParticipantConnected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    ParticipantDisconnected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    ParticipantLeft {
        user_id: UserId,
        reply: Reply,
    },
    Timer(TimerFired),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub id: u64,
}

/// Shared collaborators handed to every lobby actor.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub registry: LobbyRegistry,
    pub transport: Arc<BroadcastTransport>,
    pub results: Arc<dyn ResultStore>,
    pub catalog: Arc<dyn LocationCatalog>,
    /// Pause between scheduling a round and opening it for guesses.
    pub start_delay: Duration,
    pub retry: RetryPolicy,
}

/// Sending side of one lobby actor.
#[derive(Clone, Debug)]
pub struct LobbyHandle {
    id: LobbyId,
    tx: mpsc::UnboundedSender<LobbyEvent>,
}

impl LobbyHandle {
    pub fn id(&self) -> &LobbyId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Post an event without waiting for a reply.
    pub fn send(&self, event: LobbyEvent) -> Result<(), GameError> {
        self.tx
            .send(event)
            .map_err(|_| GameError::not_found(format!("lobby {} is closed", self.id)))
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> LobbyEvent) -> Result<T, GameError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| GameError::not_found(format!("lobby {} closed before replying", self.id)))?
    }

    pub async fn start(&self, user_id: UserId) -> Result<(), GameError> {
        self.request(|reply| LobbyEvent::Start { user_id, reply }).await
    }

    pub async fn abort(&self, user_id: UserId) -> Result<(), GameError> {
        self.request(|reply| LobbyEvent::Abort { user_id, reply }).await
    }

    pub async fn submit_guess(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        round: u32,
        coordinates: Coordinates,
    ) -> Result<(), GameError> {
        self.request(|reply| LobbyEvent::SubmitGuess {
            user_id,
            connection_id,
            round,
            coordinates,
            reply,
        })
        .await
    }

    pub async fn leave(&self, user_id: UserId) -> Result<(), GameError> {
        self.request(|reply| LobbyEvent::ParticipantLeft { user_id, reply })
            .await
    }

    pub fn heartbeat(&self, user_id: UserId) -> Result<(), GameError> {
        self.send(LobbyEvent::Heartbeat { user_id })
    }
}

struct ActorEntry {
    handle: LobbyHandle,
    task: JoinHandle<()>,
}

/// Directory of running lobby actors.
#[derive(Clone)]
pub struct Orchestrator {
    deps: OrchestratorDeps,
    actors: Arc<Mutex<HashMap<LobbyId, ActorEntry>>>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &LobbyRegistry {
        &self.deps.registry
    }

    /// Start the actor for `lobby`. Returns the existing handle if one is
    /// already running.
    pub async fn spawn_lobby(&self, lobby: Lobby) -> LobbyHandle {
        let mut actors = self.actors.lock().await;
        if let Some(entry) = actors.get(&lobby.id)
            && !entry.handle.is_closed()
        {
            return entry.handle.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LobbyHandle {
            id: lobby.id.clone(),
            tx: tx.clone(),
        };
        let actor = LobbyActor::new(lobby, self.deps.clone(), tx);
        let directory = Arc::clone(&self.actors);
        let id = handle.id.clone();
        let task = tokio::spawn(async move {
            actor.run(rx).await;
            directory.lock().await.remove(&id);
        });
        actors.insert(
            handle.id.clone(),
            ActorEntry {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }

    pub async fn handle(&self, id: &LobbyId) -> Option<LobbyHandle> {
        self.actors
            .lock()
            .await
            .get(id)
            .map(|e| e.handle.clone())
            .filter(|h| !h.is_closed())
    }

    /// Like [`Self::handle`] but reports a missing actor as `NotFound`.
    pub async fn require(&self, id: &LobbyId) -> Result<LobbyHandle, GameError> {
        self.handle(id)
            .await
            .ok_or_else(|| GameError::not_found(format!("lobby {id}")))
    }

    pub async fn active_count(&self) -> usize {
        self.actors.lock().await.len()
    }

    /// Ask one lobby to wind down. No-op if it is not running.
    pub async fn stop(&self, id: &LobbyId) {
        if let Some(handle) = self.handle(id).await {
            let _ = handle.send(LobbyEvent::Shutdown);
        }
    }

    /// Tell every lobby to finish, then wait up to `grace` for their final
    /// broadcasts and result writes. Returns how many actors were still
    /// running when the grace window closed.
    pub async fn drain(&self, grace: Duration) -> usize {
        let entries: Vec<(LobbyId, ActorEntry)> = self.actors.lock().await.drain().collect();
        if entries.is_empty() {
            return 0;
        }
        tracing::info!(lobbies = entries.len(), "Draining lobbies");
        let mut tasks = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            if entry.handle.send(LobbyEvent::Shutdown).is_err() {
                tracing::debug!(lobby = %id, "Lobby already stopped");
            }
            tasks.push(entry.task);
        }

        let deadline = Instant::now() + grace;
        let mut remaining = 0;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => {},
                Err(_) => {
                    task.abort();
                    remaining += 1;
                },
            }
        }
        if remaining > 0 {
            tracing::warn!(remaining, "Lobbies still running after grace window");
        }
        remaining
    }
}

/// Whether the actor keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct LobbyActor {
    id: LobbyId,
    deps: OrchestratorDeps,
    tx: mpsc::UnboundedSender<LobbyEvent>,
    lobby: Lobby,
    current: Option<Round>,
    closed_rounds: Vec<RoundSummary>,
    used_targets: HashSet<String>,
    round_deadline: Option<Instant>,
    armed_timer: Option<u64>,
    next_timer_id: u64,
    timer_task: Option<JoinHandle<()>>,
    seen_users: HashSet<UserId>,
    started_at_ms: Option<u64>,
    /// Set while `lobby` carries changes the registry copy missed.
    dirty: bool,
}

impl LobbyActor {
    fn new(lobby: Lobby, deps: OrchestratorDeps, tx: mpsc::UnboundedSender<LobbyEvent>) -> Self {
        Self {
            id: lobby.id.clone(),
            deps,
            tx,
            lobby,
            current: None,
            closed_rounds: Vec::new(),
            used_targets: HashSet::new(),
            round_deadline: None,
            armed_timer: None,
            next_timer_id: 0,
            timer_task: None,
            seen_users: HashSet::new(),
            started_at_ms: None,
            dirty: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LobbyEvent>) {
        tracing::debug!(lobby = %self.id, "Lobby actor started");
        while let Some(event) = rx.recv().await {
            if self.handle(event).await == Flow::Exit {
                break;
            }
        }
        if let Some(timer) = self.timer_task.take() {
            timer.abort();
        }
        tracing::debug!(lobby = %self.id, "Lobby actor stopped");
    }

    async fn handle(&mut self, event: LobbyEvent) -> Flow {
        match event {
            LobbyEvent::Start { user_id, reply } => {
                let result = self.on_start(user_id).await;
                self.respond(reply, result).await
            },
            LobbyEvent::Abort { user_id, reply } => {
                if let Err(e) = self.require_host(user_id, "abort") {
                    let _ = reply.send(Err(e));
                    return Flow::Continue;
                }
                tracing::info!(lobby = %self.id, user_id, "Game aborted by host");
                let _ = reply.send(Ok(()));
                self.finish(GameOutcome::Aborted, false).await
            },
            LobbyEvent::SubmitGuess {
                user_id,
                connection_id,
                round,
                coordinates,
                reply,
            } => {
                let result = self.on_guess(user_id, connection_id, round, coordinates).await;
                if let Err(ref e) = result {
                    tracing::warn!(lobby = %self.id, user_id, round, error = %e, "Guess rejected");
                }
                let accepted = result.is_ok();
                let flow = self.respond(reply, result).await;
                if flow == Flow::Exit || !accepted {
                    return flow;
                }
                self.close_if_all_guessed().await
            },
            LobbyEvent::Heartbeat { user_id } => {
                tracing::debug!(lobby = %self.id, user_id, "Heartbeat");
                self.touch().await;
                Flow::Continue
            },
            LobbyEvent::ParticipantConnected {
                user_id,
                connection_id,
            } => self.on_connected(user_id, connection_id).await,
            LobbyEvent::ParticipantDisconnected {
                user_id,
                connection_id,
            } => self.on_disconnected(user_id, connection_id).await,
            LobbyEvent::ParticipantLeft { user_id, reply } => {
                let _ = reply.send(Ok(()));
                self.on_left(user_id).await
            },
            LobbyEvent::Timer(fired) => self.on_timer(fired).await,
            LobbyEvent::Shutdown => {
                tracing::info!(lobby = %self.id, "Lobby shutting down");
                self.finish(GameOutcome::Aborted, false).await
            },
        }
    }

    /// Send a reply, and terminate the lobby if the error was an internal
    /// invariant failure or an expired record rather than a rejected request.
    async fn respond(&mut self, reply: Reply, result: Result<(), GameError>) -> Flow {
        let terminal = match &result {
            Err(GameError::Fatal(msg)) => Some(GameError::Fatal(msg.clone())),
            Err(GameError::Expired) => Some(GameError::Expired),
            _ => None,
        };
        let _ = reply.send(result);
        match terminal {
            Some(err) => self.fail(err).await,
            None => Flow::Continue,
        }
    }

    fn require_host(&self, user_id: UserId, action: &str) -> Result<(), GameError> {
        if self.lobby.host_user_id != user_id {
            return Err(GameError::invalid_state(format!("only the host can {action}")));
        }
        Ok(())
    }

    async fn on_start(&mut self, user_id: UserId) -> Result<(), GameError> {
        if self.lobby.state.is_started() {
            return Err(GameError::invalid_state("game already started"));
        }
        self.require_host(user_id, "start the game")?;
        self.write("start game", |lobby| {
            if lobby.state.is_started() {
                return Err(GameError::invalid_state("game already started"));
            }
            lobby.state = LobbyState::RoundPending;
            Ok(())
        })
        .await?;
        self.started_at_ms = Some(now_ms());
        self.touch().await;

        tracing::info!(
            lobby = %self.id,
            rounds = self.lobby.settings.round_count,
            players = self.lobby.participants.len(),
            "Game started"
        );
        self.broadcast(&ServerMessage::GameStarting(GameStartingMsg {
            round_count: self.lobby.settings.round_count,
            start_delay_ms: self.deps.start_delay.as_millis() as u64,
        }))
        .await;
        self.arm_timer(self.deps.start_delay);
        Ok(())
    }

    async fn on_timer(&mut self, fired: TimerFired) -> Flow {
        if self.armed_timer != Some(fired.id) {
            tracing::debug!(lobby = %self.id, timer = fired.id, "Ignoring stale timer");
            return Flow::Continue;
        }
        self.armed_timer = None;
        let result = match self.lobby.state {
            LobbyState::RoundPending => self.begin_round().await.map(|()| Flow::Continue),
            LobbyState::RoundActive => self.close_round(false).await,
            state => {
                tracing::debug!(lobby = %self.id, ?state, "Timer fired with nothing to do");
                Ok(Flow::Continue)
            },
        };
        match result {
            Ok(flow) => flow,
            Err(e) => self.fail(e).await,
        }
    }

    async fn begin_round(&mut self) -> Result<(), GameError> {
        if self.current.is_some() {
            return Err(GameError::Fatal("round opened while another is active".into()));
        }
        let index = self.closed_rounds.len() as u32;
        if index >= u32::from(self.lobby.settings.round_count) {
            return Err(GameError::Fatal(format!("round index {index} past round count")));
        }
        let target = pick_target(
            self.deps.catalog.as_ref(),
            &self.lobby.settings.target,
            &self.used_targets,
            &mut rand::rng(),
        )
        .ok_or_else(|| GameError::Fatal("location catalog is empty".into()))?;
        self.used_targets.insert(target.location_id.clone());

        let limit = self.lobby.settings.round_time_limit();
        let round = Round::new(index, target, now_ms(), limit.as_millis() as u64);
        self.write("open round", |lobby| {
            lobby.state = LobbyState::RoundActive;
            Ok(())
        })
        .await?;

        let started = round_started(&round, self.lobby.settings.round_count);
        self.current = Some(round);
        self.round_deadline = Some(Instant::now() + limit);
        self.arm_timer(limit);

        tracing::info!(lobby = %self.id, round = index, location = %started.location_id, "Round started");
        self.broadcast(&ServerMessage::RoundStarted(started)).await;
        Ok(())
    }

    async fn on_guess(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
        round: u32,
        coordinates: Coordinates,
    ) -> Result<(), GameError> {
        if self.lobby.state != LobbyState::RoundActive {
            return Err(GameError::invalid_state("no round is accepting guesses"));
        }
        let Some(current) = self.current.as_mut() else {
            return Err(GameError::Fatal("active state without a round".into()));
        };
        if current.index != round {
            return Err(GameError::invalid_state(format!(
                "guess for round {round}, current round is {}",
                current.index
            )));
        }
        if self.round_deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GameError::invalid_state("round deadline has passed"));
        }
        match self.lobby.participant(user_id) {
            None => return Err(GameError::not_found(format!("participant {user_id}"))),
            Some(p) if !p.is_connected() => {
                return Err(GameError::invalid_state("participant is not connected"));
            },
            Some(_) => {},
        }
        current.record_guess(user_id, coordinates, now_ms())?;
        tracing::debug!(lobby = %self.id, user_id, round, "Guess accepted");

        self.touch().await;
        self.send_to(connection_id, &ServerMessage::GuessAccepted(GuessAcceptedMsg { round }))
            .await;
        let guessed = ServerMessage::PlayerGuessed(PlayerGuessedMsg { round, user_id });
        if let Err(e) = self
            .deps
            .transport
            .broadcast_except(&self.id, connection_id, &guessed)
            .await
        {
            tracing::error!(lobby = %self.id, error = %e, "Failed to encode broadcast");
        }
        Ok(())
    }

    async fn close_if_all_guessed(&mut self) -> Flow {
        let all = match (&self.current, self.lobby.state) {
            (Some(round), LobbyState::RoundActive) => {
                round.all_guessed(self.lobby.connected_user_ids())
            },
            _ => false,
        };
        if !all {
            return Flow::Continue;
        }
        match self.close_round(true).await {
            Ok(flow) => flow,
            Err(e) => self.fail(e).await,
        }
    }

    async fn close_round(&mut self, early: bool) -> Result<Flow, GameError> {
        let Some(mut round) = self.current.take() else {
            return Err(GameError::Fatal("no round to close".into()));
        };
        self.round_deadline = None;
        self.armed_timer = None;

        let scores = round.close(&self.lobby.participants)?.to_vec();
        let index = round.index;
        self.write("score round", |lobby| {
            lobby.state = LobbyState::RoundScoring;
            for score in &scores {
                if let Some(p) = lobby.participant_mut(score.user_id) {
                    p.cumulative_score += score.points;
                }
            }
            Ok(())
        })
        .await?;

        tracing::info!(
            lobby = %self.id,
            round = index,
            early,
            guesses = round.guesses.len(),
            "Round closed"
        );
        self.broadcast(&ServerMessage::RoundResult(RoundResultMsg {
            round: index,
            target: round.target.clone(),
            scores,
            leaderboard: leaderboard(&self.lobby.participants),
            early,
        }))
        .await;
        self.closed_rounds.push(round.summary());

        if index + 1 < u32::from(self.lobby.settings.round_count) {
            self.write("schedule round", |lobby| {
                lobby.state = LobbyState::RoundPending;
                Ok(())
            })
            .await?;
            self.arm_timer(self.deps.start_delay);
            Ok(Flow::Continue)
        } else {
            Ok(self.finish(GameOutcome::Completed, false).await)
        }
    }

    async fn on_connected(&mut self, user_id: UserId, connection_id: ConnectionId) -> Flow {
        let result = self
            .write("mark connected", |lobby| {
                lobby.set_connection(user_id, ConnectionStatus::Connected);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            return self.fail(e).await;
        }
        if !self.lobby.contains(user_id) {
            tracing::warn!(lobby = %self.id, user_id, "Bound user is no longer a participant");
            let err = GameError::not_found(format!("user {user_id} is not in lobby {}", self.id));
            self.send_to(connection_id, &ServerMessage::error(&err)).await;
            self.deps.transport.unregister(connection_id).await;
            return Flow::Continue;
        }

        let snapshot = ServerMessage::LobbySnapshot(LobbySnapshotMsg {
            lobby: self.lobby.clone(),
            active_round: self
                .current
                .as_ref()
                .map(|r| round_started(r, self.lobby.settings.round_count)),
        });
        self.send_to(connection_id, &snapshot).await;

        let change = if self.seen_users.insert(user_id) {
            PresenceChange::Joined
        } else {
            PresenceChange::Rejoined
        };
        tracing::info!(lobby = %self.id, user_id, ?change, "Participant connected");
        self.broadcast_presence(user_id, change).await;
        Flow::Continue
    }

    async fn on_disconnected(&mut self, user_id: UserId, connection_id: ConnectionId) -> Flow {
        if self.deps.transport.is_user_bound(&self.id, user_id).await {
            tracing::debug!(lobby = %self.id, user_id, connection = %connection_id, "Superseded connection closed");
            return Flow::Continue;
        }
        if !self.lobby.contains(user_id) {
            return Flow::Continue;
        }
        if self.lobby.state == LobbyState::LobbyWaiting {
            return self.remove_participant(user_id, PresenceChange::Left).await;
        }

        if let Err(e) = self
            .write("mark disconnected", |lobby| {
                lobby.set_connection(user_id, ConnectionStatus::Disconnected);
                Ok(())
            })
            .await
        {
            return self.fail(e).await;
        }
        // Only connected participants may hold a pending guess.
        if let Some(round) = self.current.as_mut()
            && round.guesses.remove(&user_id).is_some()
        {
            tracing::debug!(lobby = %self.id, user_id, round = round.index, "Dropped guess of disconnected participant");
        }
        tracing::info!(lobby = %self.id, user_id, "Participant disconnected");
        self.broadcast_presence(user_id, PresenceChange::Disconnected)
            .await;
        self.after_membership_change().await
    }

    async fn on_left(&mut self, user_id: UserId) -> Flow {
        if let Some(round) = self.current.as_mut() {
            round.guesses.remove(&user_id);
        }
        let flow = self.remove_participant(user_id, PresenceChange::Left).await;
        if flow == Flow::Exit {
            return flow;
        }
        self.after_membership_change().await
    }

    async fn remove_participant(&mut self, user_id: UserId, change: PresenceChange) -> Flow {
        match self.deps.registry.leave_lobby(&self.id, user_id).await {
            Ok(Some(lobby)) => {
                self.lobby = lobby;
                self.broadcast_presence(user_id, change).await;
                Flow::Continue
            },
            Ok(None) => {
                tracing::info!(lobby = %self.id, "Last participant left");
                self.lobby.participants.clear();
                self.finish(GameOutcome::Aborted, false).await
            },
            Err(e) => {
                tracing::warn!(lobby = %self.id, user_id, error = %e, "Failed to remove participant");
                self.lobby.remove(user_id);
                Flow::Continue
            },
        }
    }

    /// Abort when nobody is left connected mid-game, and close the round
    /// early if everyone still connected has already guessed.
    async fn after_membership_change(&mut self) -> Flow {
        if !self.lobby.state.is_started() {
            return Flow::Continue;
        }
        if self.lobby.connected_count() == 0 {
            tracing::info!(lobby = %self.id, "All participants disconnected");
            return self.finish(GameOutcome::Aborted, false).await;
        }
        self.close_if_all_guessed().await
    }

    async fn fail(&mut self, err: GameError) -> Flow {
        if matches!(err, GameError::Expired) {
            tracing::info!(lobby = %self.id, "Lobby expired mid-game, aborting");
            return self.finish(GameOutcome::Aborted, false).await;
        }
        tracing::error!(lobby = %self.id, error = %err, "Lobby invariant violated, terminating");
        self.finish(GameOutcome::Failed, true).await
    }

    /// Enter `GAME_FINISHED`: final broadcast, teardown, then the one-time
    /// result write.
    async fn finish(&mut self, outcome: GameOutcome, error: bool) -> Flow {
        self.armed_timer = None;
        self.round_deadline = None;
        if let Some(timer) = self.timer_task.take() {
            timer.abort();
        }
        if let Some(round) = self.current.take() {
            tracing::debug!(lobby = %self.id, round = round.index, "Discarding unscored round");
        }

        if let Err(e) = self
            .write("finish game", |lobby| {
                lobby.state = LobbyState::GameFinished;
                Ok(())
            })
            .await
        {
            tracing::debug!(lobby = %self.id, error = %e, "Lobby record gone before finish");
            self.lobby.state = LobbyState::GameFinished;
        }

        let standings = leaderboard(&self.lobby.participants);
        tracing::info!(
            lobby = %self.id,
            ?outcome,
            rounds_played = self.closed_rounds.len(),
            "Game finished"
        );
        self.broadcast(&ServerMessage::GameFinished(GameFinishedMsg {
            outcome,
            leaderboard: standings.clone(),
            rounds_played: self.closed_rounds.len() as u32,
            error,
        }))
        .await;

        if let Err(e) = self.deps.registry.remove(&self.id).await {
            tracing::warn!(lobby = %self.id, error = %e, "Failed to remove finished lobby");
        }
        self.deps.transport.close_group(&self.id).await;

        if let Some(started_at_ms) = self.started_at_ms {
            let summary = GameSummary {
                lobby_id: self.id.clone(),
                host_user_id: self.lobby.host_user_id,
                settings: self.lobby.settings.clone(),
                outcome,
                started_at_ms,
                finished_at_ms: now_ms(),
                rounds: std::mem::take(&mut self.closed_rounds),
                leaderboard: standings,
            };
            self.persist(summary).await;
        }
        Flow::Exit
    }

    /// Write the summary on its own task so the live path never waits on
    /// storage. The actor still joins it before exiting, which lets shutdown
    /// drain pending writes.
    async fn persist(&self, summary: GameSummary) {
        let results = Arc::clone(&self.deps.results);
        let retry = self.deps.retry.clone();
        let id = self.id.clone();
        let write = tokio::spawn(async move {
            let result = with_backoff(&retry, "record game result", || results.record(&summary)).await;
            match result {
                Ok(()) => tracing::info!(lobby = %id, "Game result recorded"),
                Err(e) => tracing::error!(lobby = %id, error = %e, "Failed to record game result"),
            }
        });
        if let Err(e) = write.await {
            tracing::error!(lobby = %self.id, error = %e, "Result writer task failed");
        }
    }

    /// Apply `f` through the registry and adopt the stored lobby. Transient
    /// failures that outlast the registry's retries fall back to applying
    /// `f` locally so the game keeps moving, and the next write that lands
    /// carries the local changes over first. A vanished lobby is fatal; an
    /// expired one ends the game the way the reaper would.
    async fn write<F>(&mut self, what: &str, mut f: F) -> Result<(), GameError>
    where
        F: FnMut(&mut Lobby) -> Result<(), GameError>,
    {
        let local = self.dirty.then(|| self.lobby.clone());
        let result = self
            .deps
            .registry
            .update(&self.id, |lobby| {
                if let Some(local) = &local {
                    carry_over(lobby, local);
                }
                f(lobby)
            })
            .await;
        match result {
            Ok(lobby) => {
                if self.dirty {
                    tracing::info!(lobby = %self.id, what, "Registry caught up with local state");
                }
                self.lobby = lobby;
                self.dirty = false;
                Ok(())
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(lobby = %self.id, what, error = %e, "Registry write failed, continuing on local state");
                self.dirty = true;
                f(&mut self.lobby)
            },
            Err(GameError::Expired) => Err(GameError::Expired),
            Err(GameError::NotFound(_)) => {
                Err(GameError::Fatal(format!("lobby record vanished during {what}")))
            },
            Err(e) => Err(e),
        }
    }

    async fn touch(&self) {
        if let Err(e) = self.deps.registry.refresh_expiry(&self.id).await {
            tracing::warn!(lobby = %self.id, error = %e, "Failed to refresh lobby expiry");
        }
    }

    fn arm_timer(&mut self, after: Duration) {
        self.next_timer_id += 1;
        let id = self.next_timer_id;
        self.armed_timer = Some(id);
        if let Some(previous) = self.timer_task.take() {
            previous.abort();
        }
        let tx = self.tx.clone();
        self.timer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(LobbyEvent::Timer(TimerFired { id }));
        }));
    }

    async fn broadcast(&self, msg: &ServerMessage) {
        if let Err(e) = self.deps.transport.broadcast(&self.id, msg).await {
            tracing::error!(lobby = %self.id, kind = msg.type_name(), error = %e, "Failed to encode broadcast");
        }
    }

    async fn send_to(&self, connection_id: ConnectionId, msg: &ServerMessage) {
        if let Err(e) = self.deps.transport.send_to(connection_id, msg).await {
            tracing::error!(lobby = %self.id, kind = msg.type_name(), error = %e, "Failed to encode message");
        }
    }

    async fn broadcast_presence(&self, user_id: UserId, change: PresenceChange) {
        self.broadcast(&ServerMessage::Presence(PresenceMsg {
            user_id,
            change,
            host_user_id: self.lobby.host_user_id,
            state: self.lobby.state,
            participants: self.lobby.participants.clone(),
        }))
        .await;
    }
}

fn round_started(round: &Round, round_count: u8) -> RoundStartedMsg {
    RoundStartedMsg {
        round: round.index,
        round_count,
        location_id: round.target.location_id.clone(),
        started_at_ms: round.started_at_ms,
        deadline_ms: round.deadline_ms,
    }
}

/// Copy the fields the actor owns from its local view onto a registry copy
/// that missed earlier writes. Membership stays with the registry until the
/// game starts; after that nobody joins, so local removals win.
fn carry_over(stored: &mut Lobby, local: &Lobby) {
    stored.state = local.state;
    stored.host_user_id = local.host_user_id;
    if local.state.is_started() {
        stored.participants.retain(|p| local.contains(p.user_id));
    }
    for ours in &local.participants {
        if let Some(p) = stored.participant_mut(ours.user_id) {
            p.connection = ours.connection;
            p.cumulative_score = ours.cumulative_score;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use pinpoint_core::identity::Identity;
    use pinpoint_core::lobby::LobbySettings;
    use pinpoint_core::net::protocol::decode_server_message;
    use pinpoint_core::test_helpers::{FixedCatalog, identity};

    use crate::persistence::MemoryResultStore;
    use crate::store::{CasOutcome, LobbyStore, MemoryLobbyStore, Versioned};
    use crate::transport::{ConnectionInfo, TransportEvent};

    const START_DELAY: Duration = Duration::from_millis(500);
    const ROUND_LIMIT: Duration = Duration::from_secs(30);

    struct Harness {
        orch: Orchestrator,
        registry: LobbyRegistry,
        transport: Arc<BroadcastTransport>,
        results: Arc<MemoryResultStore>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    struct Client {
        user_id: UserId,
        conn: ConnectionId,
        rx: mpsc::Receiver<Bytes>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(bytes) = self.rx.try_recv() {
                if let Ok(text) = std::str::from_utf8(&bytes)
                    && let Ok(msg) = decode_server_message(text)
                {
                    out.push(msg);
                }
            }
            out
        }

        fn types(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(ServerMessage::type_name).collect()
        }
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryLobbyStore::new()), Duration::from_secs(600))
    }

    fn harness_on(store: Arc<dyn LobbyStore>, ttl: Duration) -> Harness {
        let registry = LobbyRegistry::new(store, ttl, RetryPolicy::default());
        let (transport, events) = BroadcastTransport::new(Duration::from_millis(100));
        let transport = Arc::new(transport);
        let results = Arc::new(MemoryResultStore::new());
        let deps = OrchestratorDeps {
            registry: registry.clone(),
            transport: Arc::clone(&transport),
            results: Arc::clone(&results) as Arc<dyn ResultStore>,
            catalog: Arc::new(FixedCatalog::new(&[
                ("paris", 48.8566, 2.3522),
                ("tokyo", 35.6762, 139.6503),
                ("lima", -12.0464, -77.0428),
            ])),
            start_delay: START_DELAY,
            retry: RetryPolicy::default(),
        };
        Harness {
            orch: Orchestrator::new(deps),
            registry,
            transport,
            results,
            events,
        }
    }

    impl Harness {
        async fn lobby(&self, rounds: u8) -> (LobbyId, LobbyHandle) {
            let settings = LobbySettings {
                round_count: rounds,
                round_time_limit_ms: ROUND_LIMIT.as_millis() as u64,
                ..LobbySettings::default()
            };
            let lobby = self.registry.create_lobby(&identity(1), settings).await.unwrap();
            let id = lobby.id.clone();
            (id, self.orch.spawn_lobby(lobby).await)
        }

        /// Join, register and bind a connection the way the session hub does.
        async fn connect(&mut self, id: &LobbyId, who: &Identity) -> Client {
            self.registry
                .join_lobby(id, who, ConnectionStatus::Connected)
                .await
                .unwrap();
            let info = ConnectionInfo::new(who.user_id, who.username.clone());
            let conn = info.connection_id;
            let (tx, rx) = mpsc::channel(64);
            self.transport.register(info, tx, CancellationToken::new()).await;
            self.transport.set_group(conn, id.clone()).await.unwrap();
            self.pump().await;
            Client {
                user_id: who.user_id,
                conn,
                rx,
            }
        }

        async fn disconnect(&mut self, client: &Client) {
            self.transport.unregister(client.conn).await;
            self.pump().await;
        }

        /// Forward transport events to actors, as the hub dispatcher does.
        async fn pump(&mut self) {
            while let Ok(ev) = self.events.try_recv() {
                match ev {
                    TransportEvent::Bound {
                        connection_id,
                        user_id,
                        group,
                    } => {
                        if let Some(h) = self.orch.handle(&group).await {
                            let _ = h.send(LobbyEvent::ParticipantConnected {
                                user_id,
                                connection_id,
                            });
                        }
                    },
                    TransportEvent::Disconnected {
                        connection_id,
                        user_id,
                        group: Some(group),
                    } => {
                        if let Some(h) = self.orch.handle(&group).await {
                            let _ = h.send(LobbyEvent::ParticipantDisconnected {
                                user_id,
                                connection_id,
                            });
                        }
                    },
                    TransportEvent::Disconnected { group: None, .. } => {},
                }
            }
            settle().await;
        }
    }

    /// Let spawned tasks run without moving the paused clock.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn guess(h: &LobbyHandle, c: &Client, round: u32, lat: f64, lng: f64) -> Result<(), GameError> {
        h.submit_guess(c.user_id, c.conn, round, Coordinates { lat, lng })
            .await
    }

    /// Swaps fail while `failing` is set; everything else delegates.
    struct SwapFailingStore {
        inner: MemoryLobbyStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl LobbyStore for SwapFailingStore {
        async fn get(&self, id: &LobbyId) -> Result<Versioned<Lobby>, GameError> {
            self.inner.get(id).await
        }
        async fn insert_if_absent(&self, lobby: Lobby, expires_at: Instant) -> Result<bool, GameError> {
            self.inner.insert_if_absent(lobby, expires_at).await
        }
        async fn compare_and_swap(
            &self,
            id: &LobbyId,
            expected: u64,
            lobby: Lobby,
            expires_at: Instant,
        ) -> Result<CasOutcome, GameError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(GameError::StorageUnavailable("swap refused".into()));
            }
            self.inner.compare_and_swap(id, expected, lobby, expires_at).await
        }
        async fn remove(&self, id: &LobbyId) -> Result<bool, GameError> {
            self.inner.remove(id).await
        }
        async fn purge_expired(&self, now: Instant) -> Result<Vec<LobbyId>, GameError> {
            self.inner.purge_expired(now).await
        }
        async fn len(&self) -> usize {
            self.inner.len().await
        }
    }

    fn target_coordinates(location_id: &str) -> (f64, f64) {
        match location_id {
            "paris" => (48.8566, 2.3522),
            "tokyo" => (35.6762, 139.6503),
            _ => (-12.0464, -77.0428),
        }
    }

    fn round_result_of(msgs: &[ServerMessage]) -> Option<RoundResultMsg> {
        msgs.iter().find_map(|m| match m {
            ServerMessage::RoundResult(r) => Some(r.clone()),
            _ => None,
        })
    }

    fn round_started_of(msgs: &[ServerMessage]) -> Option<RoundStartedMsg> {
        msgs.iter().find_map(|m| match m {
            ServerMessage::RoundStarted(r) => Some(r.clone()),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_round_opens_after_delay() {
        let mut h = harness();
        let (id, handle) = h.lobby(5).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let mut guest = h.connect(&id, &identity(2)).await;
        let first = host.drain();
        assert!(matches!(first[0], ServerMessage::LobbySnapshot(_)));
        guest.drain();

        handle.start(1).await.unwrap();
        settle().await;
        assert_eq!(h.registry.get_lobby(&id).await.unwrap().state, LobbyState::RoundPending);
        assert_eq!(guest.types(), vec!["game_starting"]);

        tokio::time::sleep(START_DELAY).await;
        settle().await;
        assert_eq!(h.registry.get_lobby(&id).await.unwrap().state, LobbyState::RoundActive);
        let started = round_started_of(&guest.drain()).unwrap();
        assert_eq!(started.round, 0);
        assert_eq!(started.round_count, 5);
        assert_eq!(round_started_of(&host.drain()), Some(started));
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejected_for_non_host_and_twice() {
        let mut h = harness();
        let (id, handle) = h.lobby(1).await;
        let _host = h.connect(&id, &identity(1)).await;
        let _guest = h.connect(&id, &identity(2)).await;

        assert!(matches!(handle.start(2).await, Err(GameError::InvalidState(_))));
        handle.start(1).await.unwrap();
        assert!(matches!(handle.start(1).await, Err(GameError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn round_closes_early_when_everyone_guessed() {
        let mut h = harness();
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        host.drain();

        guess(&handle, &host, 0, 48.0, 2.0).await.unwrap();
        assert_eq!(host.types(), vec!["guess_accepted"]);
        guess(&handle, &guest, 0, 0.0, 0.0).await.unwrap();
        settle().await;

        // Well before the deadline.
        let msgs = host.drain();
        let result = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoundResult(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.early);
        assert_eq!(result.round, 0);
        assert_eq!(result.scores.len(), 2);
        assert!(result.scores.iter().all(|s| s.distance_km.is_some()));
        assert_eq!(h.registry.get_lobby(&id).await.unwrap().state, LobbyState::RoundPending);

        // Next round opens at index 1.
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        assert_eq!(round_started_of(&host.drain()).unwrap().round, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn round_closes_at_deadline_and_late_guess_rejected() {
        let mut h = harness();
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        guess(&handle, &host, 0, 48.0, 2.0).await.unwrap();
        host.drain();

        tokio::time::sleep(ROUND_LIMIT - Duration::from_millis(1)).await;
        settle().await;
        assert!(!host.types().contains(&"round_result"));

        tokio::time::sleep(Duration::from_millis(1)).await;
        settle().await;
        let msgs = host.drain();
        let result = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoundResult(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert!(!result.early);
        let guest_score = result.scores.iter().find(|s| s.user_id == 2).unwrap();
        assert_eq!(guest_score.points, 0);
        assert_eq!(result.scores[0].user_id, 1);

        assert!(matches!(
            guess(&handle, &guest, 0, 1.0, 1.0).await,
            Err(GameError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_and_wrong_round_guesses_rejected() {
        let mut h = harness();
        let (id, handle) = h.lobby(1).await;
        let host = h.connect(&id, &identity(1)).await;
        let _guest = h.connect(&id, &identity(2)).await;

        assert!(matches!(
            guess(&handle, &host, 0, 1.0, 1.0).await,
            Err(GameError::InvalidState(_))
        ));
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;

        assert!(matches!(
            guess(&handle, &host, 3, 1.0, 1.0).await,
            Err(GameError::InvalidState(_))
        ));
        guess(&handle, &host, 0, 1.0, 1.0).await.unwrap();
        assert!(matches!(
            guess(&handle, &host, 0, 48.0, 2.0).await,
            Err(GameError::Conflict(_))
        ));
        assert!(matches!(
            guess(&handle, &host, 0, 95.0, 2.0).await,
            Err(GameError::MalformedInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_game_completes_and_persists_once() {
        let mut h = harness();
        let (id, handle) = h.lobby(3).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();

        let mut indices = Vec::new();
        for round in 0..3 {
            tokio::time::sleep(START_DELAY).await;
            settle().await;
            let started = round_started_of(&host.drain()).unwrap();
            indices.push(started.round);
            guess(&handle, &host, round, 10.0, 10.0).await.unwrap();
            guess(&handle, &guest, round, -10.0, -10.0).await.unwrap();
            settle().await;
        }
        assert_eq!(indices, vec![0, 1, 2]);

        let finished = host
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameFinished(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.outcome, GameOutcome::Completed);
        assert_eq!(finished.rounds_played, 3);
        assert!(!finished.error);
        assert_eq!(finished.leaderboard.len(), 2);

        settle().await;
        let summaries = h.results.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].rounds.len(), 3);
        // Distinct targets: the catalog has exactly three.
        let targets: HashSet<_> = summaries[0]
            .rounds
            .iter()
            .map(|r| r.target.location_id.clone())
            .collect();
        assert_eq!(targets.len(), 3);

        assert!(h.registry.get_lobby(&id).await.is_err());
        assert!(h.orch.handle(&id).await.is_none());
        assert_eq!(h.transport.group_size(&id).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_disconnect_mid_round_aborts_without_waiting() {
        let mut h = harness();
        let (id, handle) = h.lobby(5).await;
        let host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;

        h.disconnect(&host).await;
        assert_eq!(
            h.registry.get_lobby(&id).await.unwrap().connected_count(),
            1
        );
        h.disconnect(&guest).await;
        settle().await;

        assert!(h.orch.handle(&id).await.is_none());
        let summaries = h.results.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].outcome, GameOutcome::Aborted);
        assert!(summaries[0].rounds.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_of_last_non_guesser_closes_round() {
        let mut h = harness();
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        guess(&handle, &host, 0, 1.0, 1.0).await.unwrap();
        host.drain();

        h.disconnect(&guest).await;
        let types = host.types();
        assert!(types.contains(&"presence"));
        assert!(types.contains(&"round_result"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_mid_game_gets_snapshot_with_active_round() {
        let mut h = harness();
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;

        h.disconnect(&guest).await;
        host.drain();
        let mut back = h.connect(&id, &identity(2)).await;

        let msgs = back.drain();
        match &msgs[0] {
            ServerMessage::LobbySnapshot(s) => {
                assert_eq!(s.active_round.as_ref().map(|r| r.round), Some(0));
                assert_eq!(s.lobby.state, LobbyState::RoundActive);
            },
            other => panic!("expected snapshot, got {other:?}"),
        }
        let presence = host
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::Presence(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(presence.change, PresenceChange::Rejoined);
        assert_eq!(presence.user_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn host_leaving_while_waiting_migrates_host() {
        let mut h = harness();
        let (id, _handle) = h.lobby(1).await;
        let host = h.connect(&id, &identity(1)).await;
        let mut guest = h.connect(&id, &identity(2)).await;
        guest.drain();

        h.disconnect(&host).await;
        let lobby = h.registry.get_lobby(&id).await.unwrap();
        assert_eq!(lobby.host_user_id, 2);
        assert_eq!(lobby.participants.len(), 1);
        let presence = guest
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::Presence(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(presence.change, PresenceChange::Left);
        assert_eq!(presence.host_user_id, 2);

        // The new host can start.
        let handle = h.orch.require(&id).await.unwrap();
        handle.start(2).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connected_count_tracks_bound_connections() {
        let mut h = harness();
        let (id, handle) = h.lobby(3).await;
        let a = h.connect(&id, &identity(1)).await;
        let b = h.connect(&id, &identity(2)).await;
        let _c = h.connect(&id, &identity(3)).await;
        handle.start(1).await.unwrap();

        let check = |h: &Harness| {
            let registry = h.registry.clone();
            let transport = Arc::clone(&h.transport);
            let id = id.clone();
            async move {
                let connected = registry.get_lobby(&id).await.unwrap().connected_count();
                assert_eq!(connected, transport.group_size(&id).await);
            }
        };
        check(&h).await;
        h.disconnect(&a).await;
        check(&h).await;
        h.disconnect(&b).await;
        check(&h).await;
        let _b2 = h.connect(&id, &identity(2)).await;
        check(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_is_ignored() {
        let mut h = harness();
        let (id, handle) = h.lobby(1).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let _guest = h.connect(&id, &identity(2)).await;
        handle.send(LobbyEvent::Timer(TimerFired { id: 999 })).unwrap();
        settle().await;
        assert_eq!(h.registry.get_lobby(&id).await.unwrap().state, LobbyState::LobbyWaiting);
        assert!(host.types().iter().all(|t| *t != "round_started"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_by_host_finishes_game() {
        let mut h = harness();
        let (id, handle) = h.lobby(3).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let _guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        assert!(matches!(handle.abort(2).await, Err(GameError::InvalidState(_))));
        handle.abort(1).await.unwrap();
        settle().await;

        let finished = host
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameFinished(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.outcome, GameOutcome::Aborted);
        assert_eq!(finished.rounds_played, 0);
        assert_eq!(h.results.summaries().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_fails_only_that_lobby() {
        let mut h = harness();
        let mut deps = h.orch.deps.clone();
        deps.catalog = Arc::new(FixedCatalog::new(&[]));
        let broken = Orchestrator::new(deps);

        let lobby = h
            .registry
            .create_lobby(&identity(1), LobbySettings::default())
            .await
            .unwrap();
        let bad_id = lobby.id.clone();
        let bad = broken.spawn_lobby(lobby).await;
        let (good_id, good) = h.lobby(1).await;

        let mut bad_client = {
            h.registry
                .join_lobby(&bad_id, &identity(1), ConnectionStatus::Connected)
                .await
                .unwrap();
            let info = ConnectionInfo::new(1, "user1");
            let conn = info.connection_id;
            let (tx, rx) = mpsc::channel(64);
            h.transport.register(info, tx, CancellationToken::new()).await;
            h.transport.set_group(conn, bad_id.clone()).await.unwrap();
            Client { user_id: 1, conn, rx }
        };
        let _good_host = h.connect(&good_id, &identity(1)).await;

        bad.start(1).await.unwrap();
        good.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;

        let finished = bad_client
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameFinished(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert!(finished.error);
        assert_eq!(finished.outcome, GameOutcome::Failed);
        assert!(broken.handle(&bad_id).await.is_none());

        assert_eq!(
            h.registry.get_lobby(&good_id).await.unwrap().state,
            LobbyState::RoundActive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_finishes_every_lobby() {
        let mut h = harness();
        let (a, ha) = h.lobby(3).await;
        let (b, _hb) = h.lobby(3).await;
        let _ca = h.connect(&a, &identity(1)).await;
        let _cb = h.connect(&b, &identity(1)).await;
        ha.start(1).await.unwrap();

        let remaining = h.orch.drain(Duration::from_secs(1)).await;
        assert_eq!(remaining, 0);
        assert_eq!(h.orch.active_count().await, 0);
        // Only the started game has a summary.
        let summaries = h.results.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].lobby_id, a);
    }
    #[tokio::test(start_paused = true)]
    async fn scores_survive_failed_registry_writes() {
        let store = Arc::new(SwapFailingStore {
            inner: MemoryLobbyStore::new(),
            failing: AtomicBool::new(false),
        });
        let mut h = harness_on(Arc::clone(&store) as Arc<dyn LobbyStore>, Duration::from_secs(600));
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        let started = round_started_of(&host.drain()).unwrap();
        let (lat, lng) = target_coordinates(&started.location_id);
        guess(&handle, &host, 0, lat, lng).await.unwrap();

        // Scoring and scheduling both fall back to local state.
        store.failing.store(true, Ordering::SeqCst);
        guess(&handle, &guest, 0, lat + 1.0, lng + 1.0).await.unwrap();
        let mut result = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = round_result_of(&host.drain());
            if result.is_some() {
                break;
            }
        }
        let result = result.unwrap();
        assert!(result.leaderboard.iter().any(|e| e.score > 0));
        assert_eq!(h.registry.get_lobby(&id).await.unwrap().participants[0].cumulative_score, 0);

        // The next write that lands carries the local scores over.
        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(START_DELAY * 2).await;
        settle().await;
        assert_eq!(round_started_of(&host.drain()).unwrap().round, 1);

        let stored = h.registry.get_lobby(&id).await.unwrap();
        assert_eq!(stored.state, LobbyState::RoundActive);
        for entry in &result.leaderboard {
            let p = stored.participant(entry.user_id).unwrap();
            assert_eq!(p.cumulative_score, entry.score, "user {}", entry.user_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drops_pending_guess() {
        let mut h = harness();
        let (id, handle) = h.lobby(2).await;
        let a = h.connect(&id, &identity(1)).await;
        let b = h.connect(&id, &identity(2)).await;
        let mut c = h.connect(&id, &identity(3)).await;
        handle.start(1).await.unwrap();
        tokio::time::sleep(START_DELAY).await;
        settle().await;
        let started = round_started_of(&c.drain()).unwrap();
        let (lat, lng) = target_coordinates(&started.location_id);

        guess(&handle, &a, 0, lat, lng).await.unwrap();
        guess(&handle, &b, 0, lat, lng).await.unwrap();
        settle().await;
        h.disconnect(&a).await;
        h.disconnect(&b).await;

        let lobby = h.registry.get_lobby(&id).await.unwrap();
        assert_eq!(lobby.state, LobbyState::RoundActive);
        assert_eq!(lobby.connected_count(), 1);
        assert!(round_result_of(&c.drain()).is_none());

        // The one connected player guessing closes the round, and the
        // departed guesses score nothing.
        guess(&handle, &c, 0, lat, lng).await.unwrap();
        settle().await;
        let result = round_result_of(&c.drain()).unwrap();
        assert!(result.early);
        for user_id in [1, 2] {
            let score = result.scores.iter().find(|s| s.user_id == user_id).unwrap();
            assert_eq!(score.points, 0);
            assert!(score.distance_km.is_none());
        }
        let own = result.scores.iter().find(|s| s.user_id == 3).unwrap();
        assert!(own.points > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_mid_game_aborts_like_the_reaper() {
        let mut h = harness_on(Arc::new(MemoryLobbyStore::new()), Duration::from_secs(10));
        let (id, handle) = h.lobby(2).await;
        let mut host = h.connect(&id, &identity(1)).await;
        let _guest = h.connect(&id, &identity(2)).await;
        handle.start(1).await.unwrap();

        // Nobody guesses, so the record expires before the round deadline.
        tokio::time::sleep(START_DELAY + ROUND_LIMIT + Duration::from_secs(1)).await;
        settle().await;

        let finished = host
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameFinished(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.outcome, GameOutcome::Aborted);
        assert!(!finished.error);
        assert!(h.orch.handle(&id).await.is_none());
        let summaries = h.results.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].outcome, GameOutcome::Aborted);
    }
}
