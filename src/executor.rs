//! # Command Executor
//!
//! The executor is the only code path that talks on a session's transport.
//! Both the foreground caller and the keepalive monitor go through it, so a
//! strict locking discipline keeps their commands from ever overlapping:
//!
//! 1. Existence check: no attached session fails with `NotConnected`.
//! 2. Marker check: an already-set advisory busy marker fails fast with
//!    `LockBusy`; contenders never wait.
//! 3. Atomic acquire: a `try_lock` on the state mutex closes the race the
//!    marker check alone would leave open.
//!
//! Transport failures (including a decode timeout) get one transparent
//! reconnect-and-retransmit; a second consecutive failure surfaces as
//! `Disconnected` and leaves the session stale for the next caller to
//! recover. Server-reported errors are ordinary decoded values and are never
//! retried.

use std::future::Future;
use std::mem;
use std::sync::atomic::Ordering;

use log::{debug, warn};
use tokio::sync::MutexGuard;

use crate::error::{Error, Result};
use crate::resp::{self, Response};
use crate::session::{LinkState, Session, Transport};

impl Session {
    /// Executes one inline command and returns its decoded response.
    ///
    /// # Errors
    /// * [`Error::NotConnected`] - no session is attached
    /// * [`Error::LockBusy`] - another caller holds the session lock
    /// * [`Error::Disconnected`] - the transport failed twice in a row
    ///
    /// A decoded server error is returned as `Ok(Response::Error(..))`, not
    /// as an `Err`.
    pub async fn execute(&self, command: &str) -> Result<Response> {
        let mut link = self.acquire()?;

        let result = self.execute_locked(&mut link, command).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Enters push mode: sends `command`, then forwards every decoded
    /// response to `on_response` until `interrupt` completes, at which point
    /// a RESET is issued and control returns to the caller.
    ///
    /// The session lock is held for the entire loop, so keepalive probes
    /// fail fast with `LockBusy` instead of interleaving with pushed data.
    pub async fn stream_responses<F, I>(
        &self,
        command: &str,
        interrupt: I,
        mut on_response: F,
    ) -> Result<()>
    where
        F: FnMut(&Response),
        I: Future<Output = ()>,
    {
        let mut link = self.acquire()?;

        let result = self
            .stream_locked(&mut link, command, interrupt, &mut on_response)
            .await;
        self.busy.store(false, Ordering::Release);
        result
    }

    /// The three-step non-blocking acquire. On success the busy marker is
    /// set; callers clear it once the critical section ends.
    fn acquire(&self) -> Result<MutexGuard<'_, LinkState>> {
        if !self.attached.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::LockBusy);
        }
        let link = self.link.try_lock().map_err(|_| Error::LockBusy)?;
        self.busy.store(true, Ordering::Release);
        Ok(link)
    }

    async fn execute_locked(&self, link: &mut LinkState, command: &str) -> Result<Response> {
        let mut transport = self.take_live_transport(link).await?;
        transport.drain_stale().await;

        match transport
            .send_command(command, self.config.response_timeout)
            .await
        {
            Ok(response) => {
                *link = LinkState::Ready(transport);
                Ok(response)
            }
            Err(e) if e.is_connection_failure() => {
                warn!("Command failed ({}); reconnecting for one retry", e);
                drop(transport);

                let mut fresh = match self.open_link().await {
                    Ok(transport) => transport,
                    Err(err) => {
                        return Err(Error::disconnected(format!("reconnect failed: {}", err)))
                    }
                };

                match fresh
                    .send_command(command, self.config.response_timeout)
                    .await
                {
                    Ok(response) => {
                        *link = LinkState::Ready(fresh);
                        Ok(response)
                    }
                    Err(err) if err.is_connection_failure() => {
                        Err(Error::disconnected(format!("retry failed: {}", err)))
                    }
                    Err(err) => {
                        // Framing trouble, but the transport itself is alive
                        *link = LinkState::Ready(fresh);
                        Err(err)
                    }
                }
            }
            Err(e) => {
                *link = LinkState::Ready(transport);
                Err(e)
            }
        }
    }

    async fn stream_locked<F, I>(
        &self,
        link: &mut LinkState,
        command: &str,
        interrupt: I,
        on_response: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&Response),
        I: Future<Output = ()>,
    {
        let mut transport = self.take_live_transport(link).await?;
        transport.drain_stale().await;
        transport.send_line(command).await?;

        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                decoded = resp::read_value(&mut transport.reader, 0) => {
                    match decoded {
                        Ok(response) => on_response(&response),
                        Err(e) => return Err(e),
                    }
                }
                _ = &mut interrupt => {
                    debug!("Push mode interrupted; issuing RESET");
                    match transport
                        .send_command("RESET", self.config.response_timeout)
                        .await
                    {
                        Err(e) if e.is_connection_failure() => {
                            // Leave the link stale for the next caller
                        }
                        _ => *link = LinkState::Ready(transport),
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Takes the transport out of the link for the duration of a critical
    /// section, reconnecting a stale session first (passive recovery). While
    /// taken, the link reads `Stale`, which is exactly what the next caller
    /// should see if the critical section dies without putting it back.
    pub(crate) async fn take_live_transport(&self, link: &mut LinkState) -> Result<Transport> {
        match mem::replace(link, LinkState::Stale) {
            LinkState::Ready(transport) => Ok(transport),
            LinkState::Stale => {
                debug!("Session is stale; reconnecting before executing");
                self.open_link().await
            }
            LinkState::Down => {
                *link = LinkState::Down;
                Err(Error::NotConnected)
            }
        }
    }
}
