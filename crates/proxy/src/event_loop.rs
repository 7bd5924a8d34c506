//! Single-threaded event loop
//!
//! Waits on the host stack's descriptors and every attached slot's virtual
//! port at once. Ready ports get exactly one event each; host activity (or
//! the host timeout expiring) triggers a non-blocking event pass followed by
//! completion delivery and the lifecycle pass.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gadget::VirtualPort;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, info, trace};

use crate::error::{ProxyError, Result};
use crate::slots::SlotManager;
use crate::usb::HostStack;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the cooperative shutdown flag. No
/// `SA_RESTART`, so a blocked poll returns early.
pub fn install_shutdown_handler() -> Result<&'static AtomicBool> {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(&SHUTDOWN)
}

/// Run passes until `shutdown` is raised or a pass fails
pub fn run<S, P>(
    stack: &mut S,
    slots: &mut SlotManager<S::Device, P>,
    shutdown: &AtomicBool,
) -> Result<()>
where
    S: HostStack,
    P: VirtualPort,
{
    info!("Event loop running with {} slots", slots.len());
    while !shutdown.load(Ordering::SeqCst) {
        run_once(stack, slots)?;
    }
    info!("Shutdown requested");
    for index in 0..slots.len() {
        debug!("slot {}: {}", index, slots.state(index));
    }
    if slots.retired() > 0 {
        debug!("{} retired devices still draining", slots.retired());
    }
    Ok(())
}

/// One wait and the dispatch that follows it
pub fn run_once<S, P>(stack: &mut S, slots: &mut SlotManager<S::Device, P>) -> Result<()>
where
    S: HostStack,
    P: VirtualPort,
{
    let host_fds = stack.wait_fds()?;
    let slot_fds = slots.wait_fds();
    let timeout = if stack.has_pending_hotplug() {
        Some(Duration::ZERO)
    } else {
        stack.next_timeout()?
    };

    if host_fds.is_empty() && slot_fds.is_empty() && timeout.is_none() {
        return Err(ProxyError::EventLoop(
            "no descriptor or timeout to wait on".to_string(),
        ));
    }

    let mut pollfds = Vec::with_capacity(host_fds.len() + slot_fds.len());
    for wait in &host_fds {
        let mut flags = PollFlags::empty();
        if wait.readable {
            flags |= PollFlags::POLLIN;
        }
        if wait.writable {
            flags |= PollFlags::POLLOUT;
        }
        // SAFETY: the host stack keeps its descriptors open while its
        // context lives, and nothing in this pass runs before poll returns.
        pollfds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(wait.fd) }, flags));
    }
    for &(_, fd) in &slot_fds {
        // SAFETY: an attached port owns its socket until detach, which only
        // happens after poll returns.
        pollfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(fd) },
            PollFlags::POLLIN,
        ));
    }

    let ready = match poll(&mut pollfds, poll_timeout(timeout)) {
        Ok(n) => n,
        Err(Errno::EINTR) => {
            debug!("poll interrupted");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    trace!("poll: {} ready", ready);

    let (host_polled, slot_polled) = pollfds.split_at(host_fds.len());
    let host_ready = host_polled.iter().any(|p| is_ready(*p));
    let ready_slots: Vec<usize> = slot_fds
        .iter()
        .zip(slot_polled)
        .filter(|(_, p)| is_ready(**p))
        .map(|(&(index, _), _)| index)
        .collect();

    for index in ready_slots {
        slots.fetch_and_dispatch(index)?;
    }

    if host_ready || ready == 0 {
        stack.handle_events()?;
        slots.complete_transfers();
        slots.handle_hotplug(stack);
        slots.reconcile();
    }
    Ok(())
}

fn is_ready(fd: PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

/// Round up to whole milliseconds so a sub-millisecond timer does not spin
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(d.as_micros().div_ceil(1000))
            .unwrap_or(PollTimeout::MAX),
    }
}
