use anyhow::{anyhow, Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal,
};
use keyhole::nat_traversal::{
    bind_udp, send_once, Endpoint, Inbox, NatTraversal, NatTraversalConfig, PeerTarget,
    PunchSession, SessionEvent, ECHO_PREFIX,
};
use std::{
    env,
    io::{self, BufRead, Write},
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// How long one-shot send mode waits for a reply
const REPLY_WAIT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().collect();
    let verbose = remove_flag(&mut args, "-v");
    let strict = remove_flag(&mut args, "--strict");
    init_logging(verbose);

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let config = NatTraversalConfig::from_env()?;
    let runtime = Runtime::new()?;

    match args[1].as_str() {
        "chat" => {
            let peer = args.get(2).map(|s| parse_endpoint(s)).transpose()?;
            run_chat(&runtime, config, peer, strict)?
        }
        "nat" => run_nat_report(&runtime, config)?,
        "listen" => {
            if args.len() < 3 {
                eprintln!("Usage: {} listen <port>", args[0]);
                std::process::exit(1);
            }
            let port: u16 = args[2].parse().context("Invalid port")?;
            run_listen(&runtime, config, port)?
        }
        "send" => {
            if args.len() < 5 {
                eprintln!("Usage: {} send <ip> <port> <message>", args[0]);
                std::process::exit(1);
            }
            let target = parse_endpoint(&format!("{}:{}", args[2], args[3]))?;
            run_send(&runtime, target, &args[4])?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn remove_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_endpoint(s: &str) -> Result<Endpoint> {
    s.trim()
        .parse::<Endpoint>()
        .with_context(|| format!("Invalid IPv4 endpoint '{}', expected ip:port", s.trim()))
}

fn print_usage(program_name: &str) {
    eprintln!("keyhole - UDP hole punching chat");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} chat [peer_ip:port] [--strict]   # discover, classify, punch and chat", program_name);
    eprintln!("  {} nat                              # discovery and NAT classification only", program_name);
    eprintln!("  {} listen <port>                    # accept the first sender, echo replies", program_name);
    eprintln!("  {} send <ip> <port> <message>       # send one datagram, wait 5s for a reply", program_name);
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("  -v          debug logging (or set RUST_LOG)");
    eprintln!("  --strict    only accept traffic from the peer endpoint given");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("  STUN_SERVERS        comma separated host:port list");
    eprintln!("  LOCAL_PORT          local UDP port (default: ephemeral)");
    eprintln!("  PUNCH_PORT          port already forwarded on the router");
    eprintln!("  PUNCH_COUNT         probes per burst (default 12)");
    eprintln!("  PUNCH_INTERVAL_MS   delay between probes (default 300)");
    eprintln!("  POLL_INTERVAL_MS    receive loop wait (default 250)");
    eprintln!("  STUN_TIMEOUT_MS     per-server STUN timeout (default 3000)");
    eprintln!("  PROBE_TIMEOUT_MS    classifier probe wait (default 1000)");
    eprintln!();
    eprintln!("Exchange the printed public endpoints out of band, then start both");
    eprintln!("sides within a few seconds of each other.");
}

/// Discovery and classification, printed for the operator
fn run_nat_report(runtime: &Runtime, config: NatTraversalConfig) -> Result<()> {
    let mut nat = NatTraversal::new(config);
    let (session, report) = runtime.block_on(nat.prepare())?;

    println!("Local endpoint  : {}", report.local_endpoint);
    println!("Public endpoint : {}", report.public_endpoint);
    println!("NAT type        : {}", report.classification);
    println!("                  {}", report.classification.advice());
    if let Some(port) = report.forwarded_port {
        println!("Forwarded port  : {}", port);
    }

    runtime.block_on(session.close());
    Ok(())
}

fn run_chat(
    runtime: &Runtime,
    config: NatTraversalConfig,
    peer: Option<Endpoint>,
    strict: bool,
) -> Result<()> {
    println!("Discovering public endpoint...");
    let mut nat = NatTraversal::new(config);
    let (session, report) = runtime.block_on(nat.prepare())?;

    println!();
    println!("Your public endpoint : {}", report.public_endpoint);
    println!("NAT type             : {}", report.classification);
    println!("                       {}", report.classification.advice());
    if let Some(port) = report.forwarded_port {
        println!("Forwarded port       : {}", port);
    }
    println!();

    let stdin = io::stdin();
    let peer = match peer {
        Some(peer) => Some(peer),
        None => {
            print!("Peer public endpoint (ip:port, empty to wait for the peer): ");
            io::stdout().flush()?;
            let line = stdin.lock().lines().next().transpose()?.unwrap_or_default();
            if line.trim().is_empty() {
                None
            } else {
                Some(parse_endpoint(&line)?)
            }
        }
    };

    if peer.is_some() {
        print!("Press Enter once the peer has entered your endpoint too...");
        io::stdout().flush()?;
        let _ = stdin.lock().lines().next();
    }

    let target = match (peer, strict) {
        (Some(peer), true) => PeerTarget::Confirmed(peer),
        (Some(peer), false) => PeerTarget::Assumed(peer),
        (None, _) => PeerTarget::Unknown,
    };

    let inbox = session
        .take_inbox()
        .ok_or_else(|| anyhow!("Session inbox already taken"))?;
    runtime.block_on(async { session.start_punching(target) })?;

    println!("Punching... type when connected. Commands: /status, /punch, exit");
    println!();

    chat_loop(runtime, &session, inbox)
}

fn chat_loop(runtime: &Runtime, session: &PunchSession, mut inbox: Inbox) -> Result<()> {
    let input_buffer = Arc::new(Mutex::new(String::new()));
    let input_buffer_clone = Arc::clone(&input_buffer);

    terminal::enable_raw_mode()?;

    let receive_handle = thread::spawn(move || {
        while let Some(event) = inbox.blocking_recv() {
            let line = match event {
                SessionEvent::Established { peer } => format!("*** Connected with {} ***", peer),
                SessionEvent::Message { text, .. } => format!("Peer: {}", text),
                SessionEvent::Stranger { from, .. } => format!("[ignored datagram from {}]", from),
                SessionEvent::Probe { .. } => continue,
            };
            let buf = input_buffer_clone.lock().unwrap_or_else(|e| e.into_inner());
            print_above_prompt(&buf, &line);
        }
    });

    print!("You: ");
    io::stdout().flush()?;

    let result = input_loop(runtime, session, &input_buffer);

    terminal::disable_raw_mode()?;
    print!("\r\n");
    runtime.block_on(session.close());
    let _ = receive_handle.join();

    result
}

fn input_loop(runtime: &Runtime, session: &PunchSession, input_buffer: &Mutex<String>) -> Result<()> {
    loop {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(k) = event::read()? else {
            continue;
        };

        let mut buf = input_buffer.lock().unwrap_or_else(|e| e.into_inner());

        match (k.code, k.modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => return Ok(()),
            (KeyCode::Enter, _) => {
                let line = std::mem::take(&mut *buf);
                let line = line.trim();

                match line {
                    "" => {}
                    "exit" => return Ok(()),
                    "/status" => {
                        let stats = session.stats();
                        let peer = session
                            .peer()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        print_above_prompt(
                            "",
                            &format!(
                                "[{:?}] peer {} | probes sent {} recv {} | messages sent {} recv {} | strangers {}",
                                session.state(),
                                peer,
                                stats.probes_sent,
                                stats.probes_received,
                                stats.messages_sent,
                                stats.messages_received,
                                stats.strangers
                            ),
                        );
                        continue;
                    }
                    "/punch" => {
                        let note = match runtime.block_on(async { session.punch_again() }) {
                            Ok(()) => "[sending another probe burst]".to_string(),
                            Err(e) => format!("[cannot punch: {}]", e),
                        };
                        print_above_prompt("", &note);
                        continue;
                    }
                    text => match runtime.block_on(session.send(text)) {
                        Ok(()) => print_above_prompt("", &format!("You: {}", text)),
                        Err(e) => print_above_prompt("", &format!("[not sent: {}]", e)),
                    },
                }

                if line.is_empty() {
                    print!("\r\x1B[KYou: ");
                    io::stdout().flush()?;
                }
            }
            (KeyCode::Backspace, _) => {
                if buf.pop().is_some() {
                    print!("\r\x1B[KYou: {}", *buf);
                    io::stdout().flush()?;
                }
            }
            (KeyCode::Char(c), _) => {
                buf.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            _ => {}
        }
    }
}

/// Print `line` above the prompt and redraw the prompt with the pending input.
/// Callers hold the input buffer lock, which serializes console output.
fn print_above_prompt(pending: &str, line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = write!(stdout, "\r\x1B[K{}\r\nYou: {}", line, pending);
    let _ = stdout.flush();
}

/// Wait for anyone to write, adopt them as peer and echo every message back
fn run_listen(runtime: &Runtime, config: NatTraversalConfig, port: u16) -> Result<()> {
    runtime.block_on(async {
        let socket = bind_udp(Ipv4Addr::UNSPECIFIED, port).context("Error binding UDP socket")?;
        let session = PunchSession::new(socket, None, config.punch)?;
        let mut inbox = session
            .take_inbox()
            .ok_or_else(|| anyhow!("Session inbox already taken"))?;
        session.start_punching(PeerTarget::Unknown)?;

        println!("Listening on UDP port {}...", session.local_endpoint().port());
        println!("Press Ctrl+C to exit");
        println!();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = inbox.recv() => match event {
                    Some(SessionEvent::Message { from, text }) => {
                        println!("Received from {} -> {}", from, text);
                        match session.send(&format!("{}{}", ECHO_PREFIX, text)).await {
                            Ok(()) => println!("Sent reply"),
                            Err(e) => eprintln!("Reply failed: {}", e),
                        }
                    }
                    Some(SessionEvent::Established { peer }) => println!("Peer is {}", peer),
                    Some(SessionEvent::Stranger { from, .. }) => println!("Ignored datagram from {}", from),
                    Some(SessionEvent::Probe { .. }) => {}
                    None => break,
                },
            }
        }

        session.close().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Send one datagram and wait for a single reply
fn run_send(runtime: &Runtime, target: Endpoint, message: &str) -> Result<()> {
    runtime.block_on(async {
        let socket = bind_udp(Ipv4Addr::UNSPECIFIED, 0).context("Error creating UDP socket")?;

        println!("Sending \"{}\" to {}", message, target);
        println!("Waiting for reply...");
        match send_once(&socket, target, message, REPLY_WAIT).await? {
            Some((_, reply)) => println!("Reply: {}", reply),
            None => println!("No reply received ({} sec timeout)", REPLY_WAIT.as_secs()),
        }
        Ok::<(), anyhow::Error>(())
    })
}
