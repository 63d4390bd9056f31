// Copyright 2024 The DSI authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `UnixListener` accept loop: one OS thread per connection, `u32`
//! length-prefixed `serde_json` framing, `SO_PEERCRED`-derived caller tier,
//! and `SCM_RIGHTS` fd passing for `CommitChunkFromStream`.

use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, UnixCredentials};
use nix::sys::uio::IoSliceMut;

use crate::error::StatusCode;
use crate::rpc::protocol::{Request, Response};
use crate::service::{CallerTier, Service};

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_BYTES);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).context("reading frame body")?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut UnixStream, body: &[u8]) -> Result<()> {
    let len: u32 = body
        .len()
        .try_into()
        .context("response frame too large to encode a u32 length prefix")?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn send_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response).context("encoding response")?;
    write_frame(stream, &body)
}

/// Reads the one passed file descriptor a `CommitChunkFromStream` request
/// is expected to carry via `SCM_RIGHTS`, ahead of its length-prefixed JSON
/// frame.
fn recv_fd(stream: &UnixStream) -> Result<File> {
    use std::os::unix::io::AsRawFd;

    let mut cmsg_buf = nix::cmsg_space!(RawFd);
    let mut iobuf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut iobuf)];
    let msg = socket::recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .context("recvmsg for SCM_RIGHTS")?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // Safety: the fd was just handed to us by the kernel via
                // SCM_RIGHTS and is uniquely owned by this process.
                return Ok(unsafe { File::from_raw_fd(fd) });
            }
        }
    }
    bail!("commit_chunk_from_stream request did not carry an SCM_RIGHTS fd")
}

fn caller_tier(stream: &UnixStream) -> Result<CallerTier> {
    use std::os::unix::io::AsRawFd;

    let cred: UnixCredentials = socket::getsockopt(stream.as_raw_fd(), socket::sockopt::PeerCredentials)
        .context("reading SO_PEERCRED")?;
    Ok(match cred.uid() {
        0 => CallerTier::Root,
        uid if is_system_uid(uid) => CallerTier::System,
        _ => CallerTier::Shell,
    })
}

/// System-tier UIDs are deployment-specific; 1000 is the conventional
/// "system" service account on the platforms this daemon targets.
fn is_system_uid(uid: u32) -> bool {
    uid == 1000
}

fn dispatch(service: &Service, stream: &mut UnixStream, request: Request, tier: CallerTier) -> Response {
    let result: Result<Response, crate::error::RpcError> = (|| {
        Ok(match request {
            Request::BeginInstall { install_dir } => {
                service.begin_install(&install_dir, tier)?;
                Response::Ok
            }
            Request::CreatePartition {
                name,
                size,
                read_only,
                wipe,
            } => {
                service.create_partition(&name, size, read_only, wipe, tier)?;
                Response::Ok
            }
            Request::CommitChunkFromStream { name, len } => {
                let mut fd = recv_fd(stream).map_err(crate::error::RpcError::Other)?;
                service.write_chunk(&name, &mut fd, len, tier)?;
                Response::Ok
            }
            Request::CommitChunkFromMemory { name, data } => {
                service.commit_chunk_from_memory(&name, data, tier)?;
                Response::Ok
            }
            Request::SetSharedBuffer { size } => {
                let fd = recv_fd(stream).map_err(crate::error::RpcError::Other)?;
                service.set_shared_buffer(fd, size, tier)?;
                Response::Ok
            }
            Request::CommitChunkFromShared { name, size } => {
                service.commit_chunk_from_shared(&name, size, tier)?;
                Response::Ok
            }
            Request::FinalizePartition { name } => {
                service.finalize_partition(&name, tier)?;
                Response::Ok
            }
            Request::CloseInstall => {
                service.close_install(tier)?;
                Response::Ok
            }
            Request::AbortInstall => {
                service.abort_install(tier)?;
                Response::Ok
            }
            Request::CancelInstall => {
                service.cancel_install(tier)?;
                Response::Bool(true)
            }
            Request::Enable { one_shot } => {
                service.enable(one_shot, tier)?;
                Response::Ok
            }
            Request::Disable => {
                service.disable(tier)?;
                Response::Ok
            }
            Request::Wipe => {
                service.wipe(tier)?;
                Response::Ok
            }
            Request::Remove => {
                service.remove(tier)?;
                Response::Ok
            }
            Request::IsInstalled => Response::Bool(service.is_installed(tier)?),
            Request::IsRunning => Response::Bool(service.is_running(tier)?),
            Request::IsInProgress => Response::Bool(service.is_in_progress(tier)?),
            Request::IsEnabled => Response::Bool(service.is_enabled(tier)?),
            Request::GetInstallProgress { name } => match service.get_install_progress(&name) {
                Some(p) => Response::Progress(p),
                None => {
                    return Err(crate::error::RpcError::Malformed(format!(
                        "no progress for partition {}",
                        name
                    )))
                }
            },
            Request::GetInstalledImageDir => {
                Response::OptionalText(service.get_installed_image_dir(tier)?)
            }
            Request::ZeroPartition { name } => {
                service.zero_partition(&name, tier)?;
                Response::Ok
            }
            Request::DumpDeviceMapperDevices => {
                Response::Text(service.dump_device_mapper_devices(tier)?)
            }
            Request::OpenImageService { prefix } => {
                service.open_image_service(&prefix, tier)?;
                Response::Ok
            }
        })
    })();

    match result {
        Ok(resp) => resp,
        Err(crate::error::RpcError::Unauthorized) => {
            Response::error(StatusCode::GenericError, "unauthorized")
        }
        Err(crate::error::RpcError::Malformed(m)) => Response::error(StatusCode::GenericError, m),
        Err(crate::error::RpcError::Session(e)) => {
            let status = StatusCode::from_session_error(&e);
            Response::error(status, e.to_string())
        }
        Err(crate::error::RpcError::Other(e)) => {
            Response::error(StatusCode::GenericError, format!("{:#}", e))
        }
    }
}

fn handle_connection(service: Arc<Service>, mut stream: UnixStream) {
    let tier = match caller_tier(&stream) {
        Ok(t) => t,
        Err(e) => {
            warn!("rejecting connection: {:#}", e);
            return;
        }
    };
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(f)) => f,
            Ok(None) => {
                debug!("client disconnected");
                return;
            }
            Err(e) => {
                warn!("error reading request frame: {:#}", e);
                return;
            }
        };
        let request: Request = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                let resp = Response::error(StatusCode::GenericError, format!("malformed request: {}", e));
                let _ = send_response(&mut stream, &resp);
                continue;
            }
        };
        let response = dispatch(&service, &mut stream, request, tier);
        if let Err(e) = send_response(&mut stream, &response) {
            warn!("error writing response frame: {:#}", e);
            return;
        }
    }
}

/// Waits `Service::IDLE_SHUTDOWN_GRACE` after the last client disconnected,
/// then exits the process if no client has reconnected in the meantime and
/// no session is mid-stream (spec §2/§4.4/§9: graceful exit on last-client
/// disconnect). Runs on its own thread so the accept loop is never blocked
/// by the grace period.
fn maybe_shutdown(service: Arc<Service>, live_connections: Arc<AtomicUsize>) {
    thread::spawn(move || {
        thread::sleep(Service::IDLE_SHUTDOWN_GRACE);
        if live_connections.load(Ordering::SeqCst) == 0 && service.shutdown_is_safe() {
            info!("last client disconnected and no install in progress; shutting down");
            process::exit(0);
        }
    });
}

/// Binds `socket_path` and serves connections until the last client
/// disconnects (see `maybe_shutdown`) or the process is killed. One thread
/// per connection, matching the coarse-lock concurrency model: threads
/// don't need their own work queue because `Service` already serializes
/// state mutation internally.
pub fn serve(socket_path: &Path, service: Arc<Service>) -> Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {:?}", socket_path))?;
    info!("listening on {:?}", socket_path);

    let live_connections = Arc::new(AtomicUsize::new(0));

    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(e) => {
                error!("accept() failed: {:#}", e);
                continue;
            }
        };
        let service = Arc::clone(&service);
        let live_connections = Arc::clone(&live_connections);
        live_connections.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            handle_connection(Arc::clone(&service), stream);
            if live_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
                maybe_shutdown(service, live_connections);
            }
        });
    }
    Ok(())
}
