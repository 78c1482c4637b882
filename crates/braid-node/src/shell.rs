//! Administrative shell on a unix socket.
//!
//! A line-based operator interface: connect with `nc -U` or `socat`, type
//! commands, read answers. Interaction with the transport layer is
//! read-only introspection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use braid_transport::{Flow, Group};

use crate::error::NodeError;
use crate::users::UserRegistry;

const SLOGAN: &str = r"
   __                _     __
  / /  _______ ___  (_)___/ /
 / _ \/ __/ _ `/ _ \/ / _  /
/_.__/_/  \_,_/_//_/_/\_,_/
";

const PROMPT: &str = "braid> ";

/// What the shell is allowed to look at.
pub struct ShellContext {
    started_at: Instant,
    registry: Option<Arc<UserRegistry>>,
    client_group: Option<Arc<Group>>,
}

impl ShellContext {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            registry: None,
            client_group: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<UserRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_client_group(mut self, group: Arc<Group>) -> Self {
        self.client_group = Some(group);
        self
    }

    /// Every group in the process, labeled.
    fn groups(&self) -> Vec<(String, Arc<Group>)> {
        let mut out = Vec::new();
        if let Some(group) = &self.client_group {
            out.push(("client".to_string(), group.clone()));
        }
        if let Some(registry) = &self.registry {
            for (user_id, group) in registry.users() {
                out.push((format!("user {user_id}"), group.clone()));
            }
        }
        out
    }
}

impl Default for ShellContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The shell listener; accepts any number of concurrent operator
/// connections.
pub struct Shell {
    flow: Flow,
    listener: UnixListener,
    ctx: Arc<ShellContext>,
}

impl Shell {
    /// Bind the shell socket, replacing a stale socket file if the
    /// previous owner is gone. The file is removed again when the flow
    /// closes.
    pub async fn bind(
        parent: &Flow,
        socket_path: PathBuf,
        ctx: Arc<ShellContext>,
    ) -> Result<Self, NodeError> {
        handle_stale_socket(&socket_path).await?;

        let listener = UnixListener::bind(&socket_path)?;
        info!("shell: listening on {}", socket_path.display());

        let flow = parent.fork();
        let path = socket_path.clone();
        flow.add_on_close(move || {
            let _ = std::fs::remove_file(&path);
        });

        Ok(Self {
            flow,
            listener,
            ctx,
        })
    }

    /// Spawn the accept loop.
    pub fn run(self) {
        let Shell {
            flow,
            listener,
            ctx,
        } = self;
        let loop_flow = flow.clone();
        flow.add_task(tokio::spawn(accept_loop(listener, loop_flow, ctx)));
    }
}

/// If a socket file already exists: an answering listener means another
/// instance owns it; a refused connection means the file is stale.
async fn handle_stale_socket(path: &PathBuf) -> Result<(), NodeError> {
    if !path.exists() {
        return Ok(());
    }
    match UnixStream::connect(path).await {
        Ok(_) => Err(NodeError::Config(format!(
            "shell socket {} is already in use by another process",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            info!("shell: removing stale socket {}", path.display());
            tokio::fs::remove_file(path).await?;
            Ok(())
        }
        Err(_) => {
            tokio::fs::remove_file(path).await?;
            Ok(())
        }
    }
}

async fn accept_loop(listener: UnixListener, flow: Flow, ctx: Arc<ShellContext>) {
    loop {
        let stream = tokio::select! {
            _ = flow.closed() => {
                debug!("shell: accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("shell: accept error: {e}");
                    continue;
                }
            }
        };

        tokio::spawn(handle_conn(flow.clone(), stream, ctx.clone()));
    }
}

async fn handle_conn(flow: Flow, stream: UnixStream, ctx: Arc<ShellContext>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    if write.write_all(SLOGAN.as_bytes()).await.is_err() {
        return;
    }

    loop {
        if write.write_all(PROMPT.as_bytes()).await.is_err() {
            return;
        }

        let line = tokio::select! {
            _ = flow.closed() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            }
        };

        match dispatch(&ctx, &line) {
            Response::Quit => return,
            Response::Text(reply) => {
                if !reply.is_empty() && write.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

enum Response {
    Text(String),
    Quit,
}

/// Parse and answer one command line.
fn dispatch(ctx: &ShellContext, line: &str) -> Response {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("");
    let arg = words.next().unwrap_or("");

    let text = match command {
        "" => String::new(),
        "help" => help_text(),
        "user" => user_text(ctx),
        "debug" => debug_text(ctx),
        "dchan" => match arg {
            "" | "list" => dchan_list(ctx),
            "useful" => dchan_useful(ctx),
            "speed" => dchan_speed(ctx),
            other => format!("unknown dchan subcommand: {other}\n"),
        },
        "quit" | "exit" => return Response::Quit,
        other => format!("unknown command: {other} (try 'help')\n"),
    };
    Response::Text(text)
}

fn help_text() -> String {
    "commands:\n\
     \x20 help            this text\n\
     \x20 user            list users and their channel counts\n\
     \x20 debug           process and group overview\n\
     \x20 dchan list      per-channel heartbeat stats\n\
     \x20 dchan useful    currently useful channels per group\n\
     \x20 dchan speed     per-channel traffic rates\n\
     \x20 quit            close this session\n"
        .to_string()
}

fn user_text(ctx: &ShellContext) -> String {
    let Some(registry) = &ctx.registry else {
        return "no user registry (client-only node)\n".to_string();
    };
    let users = registry.users();
    if users.is_empty() {
        return "no users\n".to_string();
    }
    let mut out = String::new();
    for (user_id, group) in users {
        out.push_str(&format!(
            "user {user_id}: {} channels, useful {:?}\n",
            group.channel_count(),
            group.get_useful(),
        ));
    }
    out
}

fn debug_text(ctx: &ShellContext) -> String {
    let groups = ctx.groups();
    let channels: usize = groups.iter().map(|(_, g)| g.channel_count()).sum();
    let mut out = format!(
        "uptime {}s, {} groups, {} channels\n",
        ctx.started_at.elapsed().as_secs(),
        groups.len(),
        channels,
    );
    for (label, group) in groups {
        out.push_str(&format!(
            "{label}: {} channels, useful {:?}\n",
            group.channel_count(),
            group.get_useful(),
        ));
    }
    out
}

fn dchan_list(ctx: &ShellContext) -> String {
    let groups = ctx.groups();
    if groups.is_empty() {
        return "no groups\n".to_string();
    }
    let mut out = String::new();
    for (label, group) in groups {
        out.push_str(&format!("{label}:\n"));
        let info = group.get_stats_info();
        if info.is_empty() {
            out.push_str("  (no channels)\n");
        } else {
            for line in info.lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }
    }
    out
}

fn dchan_useful(ctx: &ShellContext) -> String {
    let groups = ctx.groups();
    if groups.is_empty() {
        return "no groups\n".to_string();
    }
    let mut out = String::new();
    for (label, group) in groups {
        let useful = group.get_useful_chan();
        out.push_str(&format!(
            "{label}: {} of {} useful\n",
            useful.len(),
            group.channel_count(),
        ));
        for channel in useful {
            let (rtt, since) = channel.latency();
            out.push_str(&format!(
                "  {} rtt {rtt:?} committed {since:?} ago\n",
                channel.name(),
            ));
        }
    }
    out
}

fn dchan_speed(ctx: &ShellContext) -> String {
    let groups = ctx.groups();
    if groups.is_empty() {
        return "no groups\n".to_string();
    }
    let mut out = String::new();
    for (label, group) in groups {
        out.push_str(&format!("{label}:\n"));
        for channel in group.channels() {
            out.push_str(&format!("  {} {}\n", channel.name(), channel.speed()));
        }
    }
    out
}
