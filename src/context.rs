use core::fmt;
use core::time::Duration;

use std::sync::Arc;

use log::{debug, trace};

use crate::aio::Aio;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::registry::OpenFlag;
use crate::signal::Signal;
use crate::socket::{Block, ResourceState, Socket, SocketCore};
use crate::wait::{self, Messaging};

pub(crate) struct ContextCore {
    id: u32,
    socket: Arc<SocketCore>,
    open: OpenFlag,
}

impl ContextCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// A context is usable only while both it and its socket are open.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.open.is_open() && self.socket.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    pub(crate) fn submit_send(&self, data: Vec<u8>, aio: &Aio<()>) -> Result<()> {
        self.ensure_open()?;
        self.socket.submit_send(self.id, data, aio)
    }

    pub(crate) fn submit_recv(&self, aio: &Aio<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        self.socket.submit_recv(self.id, aio)
    }

    fn close(&self) -> bool {
        if !self.open.close() {
            return false;
        }

        self.socket.close_context(self.id);

        debug!("Context {} closed", self.id);

        true
    }
}

struct ContextHandle {
    core: Arc<ContextCore>,
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        let core = self.core.clone();

        dispatch::defer(move || {
            if core.close() {
                trace!("Context {} finalized", core.id());
            }
        });
    }
}

/// An independent request/reply state machine on a req or rep socket.
///
/// Several contexts on one socket can each have a request in flight. The
/// context keeps its socket's native state alive, but not the socket's host
/// handle: closing or dropping the [`Socket`] invalidates every context.
#[derive(Clone)]
pub struct Context {
    handle: Arc<ContextHandle>,
}

impl Context {
    /// Opens a context on a req or rep socket; other protocols report
    /// `Not supported`.
    pub fn open(socket: &Socket) -> Result<Self> {
        let id = socket.core().open_context()?;

        debug!("Context {id} opened on socket {}", socket.id());

        Ok(Self {
            handle: Arc::new(ContextHandle {
                core: Arc::new(ContextCore {
                    id,
                    socket: socket.core().clone(),
                    open: OpenFlag::new(),
                }),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.core().id()
    }

    pub fn socket_id(&self) -> u32 {
        self.core().socket.id()
    }

    pub fn state(&self) -> ResourceState {
        if self.core().ensure_open().is_ok() {
            ResourceState::Open
        } else {
            ResourceState::Closed
        }
    }

    pub fn send(&self, data: &[u8], block: Block) -> Result<()> {
        let aio = wait::send_aio(self, data, None, None)?;

        wait::settle(&aio, block, self.core().socket.send_timeout())
    }

    pub fn recv(&self, block: Block) -> Result<Vec<u8>> {
        let aio = wait::recv_aio(self, None, None)?;

        wait::settle(&aio, block, self.core().socket.recv_timeout())
    }

    pub fn send_aio(&self, data: &[u8], timeout: Option<Duration>) -> Result<Aio<()>> {
        wait::send_aio(self, data, timeout, None)
    }

    pub fn recv_aio(&self, timeout: Option<Duration>) -> Result<Aio<Vec<u8>>> {
        wait::recv_aio(self, timeout, None)
    }

    /// Sends `data` and receives the reply in one AIO. See [`wait::request`].
    pub fn request(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
        signal: Option<&Signal>,
    ) -> Result<Aio<Vec<u8>>> {
        wait::request(self, data, timeout, signal)
    }

    /// Closes the context, failing its pending receives. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core().close();

        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.handle.core
    }
}

impl Messaging for Context {
    fn origin(&self) -> u32 {
        self.id()
    }

    fn submit_send(&self, data: Vec<u8>, aio: &Aio<()>) -> Result<()> {
        self.core().submit_send(data, aio)
    }

    fn submit_recv(&self, aio: &Aio<Vec<u8>>) -> Result<()> {
        self.core().submit_recv(aio)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("socket", &self.socket_id())
            .field("state", &self.state())
            .finish()
    }
}
