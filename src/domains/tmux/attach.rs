use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::{CoreError, Result};

/// Ctrl-Q. Ctrl-D would be forwarded to the assistant and terminate it, so
/// the detach key must be something the shell does not interpret as EOF.
pub const DETACH_KEY: u8 = 0x11;

const IO_BUF_SIZE: usize = 8192;

/// A live attachment: a pseudoterminal running `tmux attach-session`, with
/// both I/O pumps and the resize watcher supervised by one task. Dropping the
/// guard (or calling `stop`) signals the supervisor, which kills the attach
/// client, closes the pseudoterminal, and restores the terminal mode.
pub struct AttachGuard {
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Cheap handle for detaching from another task while `wait` is pending.
#[derive(Debug, Clone)]
pub struct DetachHandle {
    stop_tx: watch::Sender<bool>,
}

impl DetachHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl AttachGuard {
    pub fn spawn(session_name: &str) -> Result<AttachGuard> {
        let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;

        let mut cmd = CommandBuilder::new("tmux");
        cmd.args(["attach-session", "-t", session_name]);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        // The child holds its own copy of the slave end.
        drop(pair.slave);

        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        let writer = master
            .take_writer()
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        let mut killer = child.clone_killer();

        enable_raw_mode().map_err(CoreError::Io)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        // Output pump: PTY -> controlling terminal. Plain thread; it blocks
        // in read() and exits when the PTY closes.
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut stdout = std::io::stdout();
            let mut buf = [0u8; IO_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).is_err() {
                            break;
                        }
                        let _ = stdout.flush();
                    }
                }
            }
        });

        // Input pump: controlling terminal -> PTY, scanning for the detach
        // key. Runs on tokio's stdin so the supervisor can outpace it.
        let (detach_tx, mut detach_rx) = watch::channel(false);
        let input_task = tokio::spawn(async move {
            let mut writer = writer;
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; IO_BUF_SIZE];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        if let Some(pos) = chunk.iter().position(|&b| b == DETACH_KEY) {
                            let _ = writer.write_all(&chunk[..pos]);
                            let _ = writer.flush();
                            let _ = detach_tx.send(true);
                            break;
                        }
                        if writer.write_all(chunk).is_err() {
                            break;
                        }
                        let _ = writer.flush();
                    }
                }
            }
        });

        let mut child_wait = tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });

        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            #[cfg(unix)]
            let mut winch =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();

            loop {
                #[cfg(unix)]
                let resize = async {
                    match winch.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                #[cfg(not(unix))]
                let resize = std::future::pending::<()>();

                tokio::select! {
                    _ = &mut child_wait => break,
                    _ = detach_rx.changed() => break,
                    _ = stop_rx.changed() => break,
                    _ = resize => {
                        if let Ok((cols, rows)) = crossterm::terminal::size() {
                            let _ = master.resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            });
                        }
                    }
                }
            }

            // Teardown order: kill the attach client, close the PTY (which
            // unblocks the output pump), stop the input pump, restore the
            // terminal, then report completion.
            let _ = killer.kill();
            drop(master);
            input_task.abort();
            let _ = disable_raw_mode();
            let _ = done_tx.send(true);
        });

        Ok(AttachGuard { stop_tx, done_rx })
    }

    pub fn handle(&self) -> DetachHandle {
        DetachHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the attachment to end, whichever way it ends.
    pub async fn wait(&self) {
        let mut done_rx = self.done_rx.clone();
        while !*done_rx.borrow() {
            if done_rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_key_is_ctrl_q_not_ctrl_d() {
        assert_eq!(DETACH_KEY, 0x11);
        assert_ne!(DETACH_KEY, 0x04);
    }

    #[test]
    fn detach_key_found_mid_chunk() {
        let chunk = [b'a', b'b', DETACH_KEY, b'c'];
        let pos = chunk.iter().position(|&b| b == DETACH_KEY);
        assert_eq!(pos, Some(2));
    }
}
