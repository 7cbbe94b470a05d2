use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossterm::tty::IsTty;
use futures::StreamExt;
use parking_lot::Mutex;
use protos::bmc::v1::ConsoleDataChunk;
use tokio::sync::{mpsc, watch};

use crate::error::ClientError;
use crate::orchestrator::ConsoleConnection;

const CTRL_C: u8 = 0x03;
const CTRL_RBRACKET: u8 = 0x1d;

/// What the stdin scanner decided about one byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScanOutcome {
    Forward,
    Interrupted,
    Exit,
}

/// Detects Ctrl+C and the Ctrl+] `q` exit sequence. The primed state
/// survives across reads; any byte other than `q` (or another Ctrl+]) after
/// priming clears it.
#[derive(Default)]
struct ExitScanner {
    primed: bool,
}

impl ExitScanner {
    fn scan(&mut self, byte: u8) -> ScanOutcome {
        if byte == CTRL_RBRACKET {
            self.primed = true;
            return ScanOutcome::Forward;
        }
        if self.primed && byte == b'q' {
            return ScanOutcome::Exit;
        }
        self.primed = false;
        if byte == CTRL_C {
            return ScanOutcome::Interrupted;
        }
        ScanOutcome::Forward
    }
}

/// Translates bare `\r` to `\n` for append-only output, preserving `\r\n`.
/// A trailing `\r` is held back until the next chunk decides its fate.
#[derive(Default)]
pub struct CrLfTranslator {
    pending_cr: bool,
}

impl CrLfTranslator {
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1);
        for &byte in data {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    out.push(b'\r');
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\n');
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
        out
    }

    /// Flush a pending carriage return at end of stream.
    pub fn finish(&mut self) -> Vec<u8> {
        if std::mem::take(&mut self.pending_cr) {
            vec![b'\n']
        } else {
            Vec::new()
        }
    }
}

/// Restores the TTY on drop, i.e. on every exit path.
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self, ClientError> {
        if !std::io::stdin().is_tty() {
            return Err(ClientError::NotATty);
        }
        crossterm::terminal::enable_raw_mode()
            .map_err(|err| ClientError::Internal(format!("failed to enter raw mode: {err}")))?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = crossterm::terminal::disable_raw_mode() {
            eprintln!("failed to restore terminal: {err}");
        }
    }
}

/// Idempotent shutdown: the first close sends a close_stream frame, closes
/// the local send half, and signals done; later calls are no-ops.
struct Closer {
    sender: mpsc::Sender<ConsoleDataChunk>,
    session_id: String,
    server_id: String,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Closer {
    fn new(
        sender: mpsc::Sender<ConsoleDataChunk>,
        session_id: String,
        server_id: String,
        done: watch::Sender<bool>,
    ) -> Arc<Self> {
        Arc::new(Closer {
            sender,
            session_id,
            server_id,
            done,
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.try_send(ConsoleDataChunk {
            session_id: self.session_id.clone(),
            server_id: self.server_id.clone(),
            data: Default::default(),
            is_handshake: false,
            close_stream: true,
        });
        let _ = self.done.send(true);
    }
}

fn data_chunk(session_id: &str, server_id: &str, data: Vec<u8>) -> ConsoleDataChunk {
    ConsoleDataChunk {
        session_id: session_id.to_owned(),
        server_id: server_id.to_owned(),
        data: data.into(),
        is_handshake: false,
        close_stream: false,
    }
}

/// Bridge the local terminal to an open console connection until the user
/// exits, the remote closes, or a signal arrives. The TTY is restored on
/// every path out of this function.
pub async fn run_console(connection: ConsoleConnection, raw_output: bool) -> Result<(), ClientError> {
    let ConsoleConnection {
        session_id,
        server_id,
        sender,
        mut inbound,
    } = connection;

    // Stdout belongs to console bytes; everything human-facing goes to
    // stderr.
    eprint!("\x1b[2J\x1b[H");
    eprintln!("Connected to {server_id} (session {session_id}). Exit with Ctrl+] q.");

    let guard = RawModeGuard::enter()?;

    let (done_tx, mut done_rx) = watch::channel(false);
    let closer = Closer::new(sender.clone(), session_id.clone(), server_id.clone(), done_tx);

    // stdin -> stream. Scans each byte for Ctrl+C and the exit sequence
    // under a lock, because the closing logic runs concurrently with it.
    // The blocking read may park until the next keystroke; the thread is
    // detached so exiting never waits on it.
    let reader_closer = closer.clone();
    let reader_sender = sender.clone();
    let reader_session = session_id.clone();
    let reader_server = server_id.clone();
    let scanner = Arc::new(Mutex::new(ExitScanner::default()));
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            if reader_closer.closed.load(Ordering::SeqCst) {
                break;
            }
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => {
                    reader_closer.close();
                    break;
                }
                Ok(n) => n,
            };

            let mut outcome = ScanOutcome::Forward;
            let mut forward_until = n;
            {
                let mut scanner = scanner.lock();
                for (i, &byte) in buf[..n].iter().enumerate() {
                    match scanner.scan(byte) {
                        ScanOutcome::Forward => {}
                        other => {
                            outcome = other;
                            forward_until = i;
                            break;
                        }
                    }
                }
            }

            if forward_until > 0
                && reader_sender
                    .blocking_send(data_chunk(
                        &reader_session,
                        &reader_server,
                        buf[..forward_until].to_vec(),
                    ))
                    .is_err()
            {
                reader_closer.close();
                break;
            }

            match outcome {
                ScanOutcome::Forward => {}
                ScanOutcome::Interrupted => {
                    eprintln!("interrupted");
                    reader_closer.close();
                    break;
                }
                ScanOutcome::Exit => {
                    reader_closer.close();
                    break;
                }
            }
        }
    });

    // stream -> stdout, with signal and done arbitration.
    let mut translator = CrLfTranslator::default();
    let mut stdout = std::io::stdout();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|err| ClientError::Internal(format!("failed to attach SIGTERM: {err}")))?;
    let result = loop {
        tokio::select! {
            _ = done_rx.changed() => break Ok(()),
            _ = tokio::signal::ctrl_c() => {
                closer.close();
                break Ok(());
            }
            _ = sigterm.recv() => {
                closer.close();
                break Ok(());
            }
            frame = inbound.next() => match frame {
                None => {
                    closer.close();
                    break Ok(());
                }
                Some(Err(status)) => {
                    closer.close();
                    break Err(ClientError::from(status));
                }
                Some(Ok(chunk)) => {
                    if chunk.close_stream {
                        closer.close();
                        break Ok(());
                    }
                    let bytes = if raw_output {
                        chunk.data.to_vec()
                    } else {
                        translator.push(&chunk.data)
                    };
                    if stdout.write_all(&bytes).and_then(|_| stdout.flush()).is_err() {
                        closer.close();
                        break Ok(());
                    }
                }
            }
        }
    };

    if !raw_output {
        let tail = translator.finish();
        let _ = stdout.write_all(&tail);
        let _ = stdout.flush();
    }

    closer.close();
    drop(guard);
    eprintln!();
    eprintln!("Console session {session_id} closed.");
    result
}
