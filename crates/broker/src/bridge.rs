//! Supervises the agent process and shuttles between its pipes and the
//! rest of the broker.
//!
//! Output lines are dispatched one at a time, in order, so credit and
//! permission events reach observers in the order the agent printed them.
//! Waiting for a decision never blocks that loop: each prompt gets its own
//! waiter task, and every outcome is funnelled into a single writer task
//! that owns the agent's stdin.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nod_common::{Outcome, PermissionRequest, RequestId};
use serde_json::json;
use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AgentCommand;
use crate::correlator::{DecisionHandle, Reply, ReplySender, RequestCorrelator};
use crate::error::{BrokerError, Result};
use crate::journal::{Journal, JournalEvent};
use crate::ledger::CreditLedger;
use crate::matcher::LineMatcher;
use crate::registry::ObserverRegistry;
use crate::risk::RiskClassifier;

const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AgentBridge {
    matcher: Arc<dyn LineMatcher>,
    classifier: RiskClassifier,
    correlator: RequestCorrelator,
    registry: ObserverRegistry,
    ledger: CreditLedger,
    journal: Option<Arc<Journal>>,
    nominal_cost: f64,
}

impl AgentBridge {
    pub fn new(
        matcher: Arc<dyn LineMatcher>,
        classifier: RiskClassifier,
        correlator: RequestCorrelator,
        registry: ObserverRegistry,
        ledger: CreditLedger,
        nominal_cost: f64,
    ) -> Self {
        Self {
            matcher,
            classifier,
            correlator,
            registry,
            ledger,
            journal: None,
            nominal_cost,
        }
    }

    pub fn with_journal(mut self, journal: Option<Arc<Journal>>) -> Self {
        self.journal = journal;
        self
    }

    /// Starts the agent and the tasks that serve its pipes.
    pub fn launch(&self, command: &AgentCommand) -> Result<AgentSession> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| BrokerError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            return Err(BrokerError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "agent stdio pipes unavailable",
                ),
            });
        };

        info!(
            program = %command.program,
            args = ?command.args,
            pid = ?pid,
            "Agent process started"
        );

        tokio::spawn(forward_stderr(stderr));
        let output = self.attach(BufReader::new(stdout), stdin);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let bridge = self.clone();
        let supervisor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Stopping agent process");
                    if let Err(err) = child.start_kill() {
                        debug!("Agent kill failed: {}", err);
                    }
                    child.wait().await
                }
            };

            // drain whatever the agent printed before it went away; a
            // descendant may still hold the pipe open
            let mut output = output;
            match tokio::time::timeout(OUTPUT_DRAIN, &mut output).await {
                Ok(Err(err)) => error!("Agent output task failed: {}", err),
                Ok(Ok(())) => {}
                Err(_) => {
                    debug!("Agent output still open after exit; detaching");
                    output.abort();
                }
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    error!("Failed to wait for agent process: {}", err);
                    None
                }
            };
            bridge.agent_exited(code).await;
            code
        });

        Ok(AgentSession {
            pid,
            kill: Some(kill_tx),
            supervisor,
        })
    }

    /// Serves an agent reachable through arbitrary streams: reads prompts from
    /// `output`, writes answers to `input`. Returns the task reading `output`;
    /// it finishes at end of stream.
    pub fn attach<R, W>(&self, output: R, input: W) -> JoinHandle<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (replies, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_replies(input, reply_rx));

        let bridge = self.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge.pump_output(output, replies).await {
                warn!("Agent output stream failed: {}", err);
            }
        })
    }

    async fn pump_output<R>(&self, mut output: R, replies: ReplySender) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if output.read_until(b'\n', &mut buf).await? == 0 {
                debug!("Agent output closed");
                return Ok(());
            }
            let line = decode_line(&buf);
            self.dispatch_line(&line, &replies).await;
        }
    }

    /// Turns one line of agent output into credit and permission events.
    pub(crate) async fn dispatch_line(&self, line: &str, replies: &ReplySender) {
        info!(target: "agent", "{}", line);

        if let Some(delta) = self.matcher.credit(line) {
            if let Some(update) = self.ledger.add(delta).await {
                debug!(total = update.total, delta, "Credits updated");
                self.registry.broadcast(&update.to_event()).await;
                self.journal(
                    JournalEvent::Credits,
                    None,
                    json!({ "total": update.total, "delta": update.delta }),
                );
            }
        }

        if let Some(prompt) = self.matcher.prompt(line) {
            let risk = self.classifier.classify(&prompt.action, &prompt.target);
            let (request, handle) = self
                .correlator
                .allocate_answering(
                    prompt.action,
                    prompt.target,
                    risk,
                    self.nominal_cost,
                    replies.clone(),
                )
                .await;

            self.journal(
                JournalEvent::Request,
                Some(request.id),
                json!({
                    "action": request.action,
                    "target": request.target,
                    "risk": request.risk,
                    "raw": prompt.raw,
                }),
            );

            let delivered = self.registry.broadcast(&request.to_event()).await;
            info!(
                request_id = request.id,
                action = %request.action,
                target = %request.target,
                risk = %request.risk,
                observers = delivered,
                "Permission requested"
            );

            if let Some(journal) = self.journal.clone() {
                journal_decision(journal, request, handle);
            }
        }
    }

    async fn agent_exited(&self, code: Option<i32>) {
        let expired = self.correlator.expire_all().await;
        info!(exit_code = ?code, expired, "Agent process exited");
        self.journal(
            JournalEvent::AgentExit,
            None,
            json!({ "code": code, "expired": expired }),
        );
    }

    fn journal(&self, ev: JournalEvent, request_id: Option<RequestId>, meta: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(ev, request_id, meta) {
                warn!("Failed to append to journal: {}", err);
            }
        }
    }
}

/// Handle on a launched agent.
pub struct AgentSession {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<Option<i32>>,
}

impl AgentSession {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the agent to exit on its own. Returns its exit code.
    pub async fn wait(self) -> Option<i32> {
        let _keep_alive = self.kill;
        self.supervisor.await.unwrap_or(None)
    }

    /// Kills the agent if it is still running and waits for cleanup.
    pub async fn shutdown(mut self) -> Option<i32> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.supervisor.await.unwrap_or(None)
    }
}

/// The reply is already queued when the handle resolves, so this only
/// records the outcome.
fn journal_decision(journal: Arc<Journal>, request: PermissionRequest, handle: DecisionHandle) {
    tokio::spawn(async move {
        let outcome = handle.wait().await;
        let note = match &outcome {
            Outcome::Approved { note } => note.clone(),
            _ => None,
        };
        let meta = json!({
            "status": outcome.status(),
            "note": note,
            "target": request.target,
        });
        if let Err(err) = journal.append(JournalEvent::Decision, Some(request.id), meta) {
            warn!(request_id = request.id, "Failed to journal decision: {}", err);
        }
    });
}

async fn write_replies<W>(mut input: W, mut replies: mpsc::UnboundedReceiver<Reply>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = replies.recv().await {
        let line = format!("{}\n", reply.outcome.reply());
        let written = async {
            input.write_all(line.as_bytes()).await?;
            input.flush().await
        }
        .await;

        match written {
            Ok(()) if reply.outcome.is_approved() => {
                info!(request_id = reply.id, "Approved request");
            }
            Ok(()) => {
                info!(request_id = reply.id, status = ?reply.outcome.status(), "Rejected request");
            }
            Err(err) => {
                debug!(request_id = reply.id, "Could not deliver answer to agent: {}", err);
            }
        }
    }
}

async fn forward_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => warn!(target: "agent::stderr", "{}", decode_line(&buf)),
            Err(err) => {
                debug!("Agent stderr closed: {}", err);
                break;
            }
        }
    }
}

/// Lossy UTF-8 without the line terminator or terminal escape sequences.
fn decode_line(bytes: &[u8]) -> String {
    let decode = |data: &[u8]| {
        String::from_utf8_lossy(data)
            .trim_end_matches(['\n', '\r'])
            .to_string()
    };

    if !bytes.contains(&0x1b) {
        return decode(bytes);
    }

    match strip(bytes) {
        Ok(clean) => decode(&clean),
        Err(err) => {
            debug!(?err, "Failed to strip ANSI escapes from agent output");
            decode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternMatcher;
    use nod_common::{BrokerEvent, Decision, RiskLevel};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Harness {
        bridge: AgentBridge,
        correlator: RequestCorrelator,
        registry: ObserverRegistry,
        ledger: CreditLedger,
    }

    fn harness(timeout: Duration) -> Harness {
        let correlator = RequestCorrelator::new(timeout);
        let registry = ObserverRegistry::default();
        let ledger = CreditLedger::new();
        let bridge = AgentBridge::new(
            Arc::new(PatternMatcher::builtin().unwrap()),
            RiskClassifier::default(),
            correlator.clone(),
            registry.clone(),
            ledger.clone(),
            0.5,
        );
        Harness {
            bridge,
            correlator,
            registry,
            ledger,
        }
    }

    fn event(payload: &str) -> BrokerEvent {
        serde_json::from_str(payload).unwrap()
    }

    async fn read_line(input: &mut DuplexStream) -> String {
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn credit_and_prompt_events_keep_line_order() {
        let h = harness(Duration::from_secs(120));
        let (_, mut observer) = h.registry.register().await;
        let (replies, _reply_rx) = mpsc::unbounded_channel();

        h.bridge.dispatch_line("Used 1.2 credits", &replies).await;
        h.bridge
            .dispatch_line("permission to delete [.env.backup]?", &replies)
            .await;
        h.bridge.dispatch_line("Used 0.3 credits", &replies).await;

        assert_eq!(
            event(&observer.recv().await.unwrap()),
            BrokerEvent::Credits {
                total: 1.2,
                delta: 1.2
            }
        );
        match event(&observer.recv().await.unwrap()) {
            BrokerEvent::Permission {
                id,
                action,
                target,
                risk,
                credits,
                ..
            } => {
                assert_eq!(id, 0);
                assert_eq!(action, "delete");
                assert_eq!(target, ".env.backup");
                assert_eq!(risk, RiskLevel::High);
                assert_eq!(credits, 0.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            event(&observer.recv().await.unwrap()),
            BrokerEvent::Credits { .. }
        ));
        assert_eq!(h.ledger.total().await, 1.2 + 0.3);
    }

    #[test]
    fn decoded_lines_lose_terminators_and_colors() {
        assert_eq!(decode_line(b"Used 1.2 credits\r\n"), "Used 1.2 credits");
        assert_eq!(
            decode_line(b"\x1b[1;33mAllow Kilo to read [a.txt]?\x1b[0m\n"),
            "Allow Kilo to read [a.txt]?"
        );
        assert_eq!(decode_line(b"caf\xff\n"), "caf\u{fffd}");
    }

    #[tokio::test]
    async fn inert_lines_emit_nothing() {
        let h = harness(Duration::from_secs(120));
        let (_, mut observer) = h.registry.register().await;
        let (replies, _reply_rx) = mpsc::unbounded_channel();

        h.bridge
            .dispatch_line("[KILO] Processing request...", &replies)
            .await;
        assert!(observer.try_recv().is_err());
        assert!(h.correlator.pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn prompts_do_not_wait_for_each_other() {
        let h = harness(Duration::from_secs(120));
        let (agent_out, mut feed) = duplex(1024);
        let (input, mut agent_in) = duplex(1024);
        let output = h.bridge.attach(BufReader::new(agent_out), input);

        feed.write_all(b"Allow Kilo to edit [src/config.js]?\nAllow Kilo to run [npm install axios]?\n")
            .await
            .unwrap();

        while h.correlator.pending_ids().await.len() < 2 {
            tokio::task::yield_now().await;
        }

        // answer the second prompt first
        assert!(h.correlator.resolve(1, Decision::parse("deny")).await);
        assert_eq!(read_line(&mut agent_in).await, "n\n");
        assert!(h.correlator.resolve(0, Decision::parse("approve")).await);
        assert_eq!(read_line(&mut agent_in).await, "y\n");

        drop(feed);
        output.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_answers_reach_stdin_in_resolution_order() {
        for _ in 0..200 {
            let h = harness(Duration::from_secs(120));
            let (agent_out, mut feed) = duplex(1024);
            let (input, mut agent_in) = duplex(1024);
            let output = h.bridge.attach(BufReader::new(agent_out), input);

            feed.write_all(b"Allow Kilo to edit [a.txt]?\nAllow Kilo to edit [b.txt]?\n")
                .await
                .unwrap();
            while h.correlator.pending_ids().await.len() < 2 {
                tokio::task::yield_now().await;
            }

            assert!(h.correlator.resolve(1, Decision::Deny).await);
            assert!(h.correlator.resolve(0, Decision::parse("approve")).await);

            let mut buf = [0u8; 4];
            agent_in.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"n\ny\n");

            drop(feed);
            output.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_answers_no() {
        let h = harness(Duration::from_secs(120));
        let (agent_out, mut feed) = duplex(1024);
        let (input, mut agent_in) = duplex(1024);
        let _output = h.bridge.attach(BufReader::new(agent_out), input);

        feed.write_all(b"permission to modify package.json?\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut agent_in).await, "n\n");
        assert_eq!(h.correlator.stats().expired, 1);
    }

    #[tokio::test]
    async fn agent_exit_expires_pending_requests() {
        let h = harness(Duration::from_secs(120));
        let (replies, mut reply_rx) = mpsc::unbounded_channel();
        h.bridge
            .dispatch_line("permission to run [make deploy]?", &replies)
            .await;

        h.bridge.agent_exited(Some(0)).await;

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(
            reply,
            Reply {
                id: 0,
                outcome: Outcome::Expired
            }
        );
        assert!(h.correlator.pending_ids().await.is_empty());
    }
}
