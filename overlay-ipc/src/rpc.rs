//! Request/response channel between the main process and one overlay.
//!
//! ```text
//!  overlay                                   main
//!  ───────                                   ────
//!  message().clear(ty); encode args
//!  finish_overlay_request()  ── request ──►  wait_for_overlay_request()
//!                                            decode, run handler, encode result
//!  wait_for_main_response()  ◄─ response ──  finish_main_response()
//!  read result
//! ```
//!
//! The overlay creates the objects (named after its pid) and owns the
//! segment first; the main side opens them after a successful negotiation.

mod channel;
mod message;
mod types;

pub use channel::{ChannelRole, MainRole, OverlayRole, RpcChannel, RpcResources};
pub use message::RpcMessage;
pub use types::{RPC_PAYLOAD_SIZE, RPC_SHMEM_SIZE, RpcError, RpcNames, RpcSegment, WaitResult};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::*;
    use crate::chain::{CopyMode, find_in_chain, link_chain};
    use crate::config::Config;
    use crate::fixup::MAX_POINTER_FIXUPS;
    use crate::ipc::process::tests::reaped_pid;
    use crate::ipc::process::{PeerProcess, ProcessId};
    use crate::ipc::shmem::{Opener, Shm};
    use crate::ipc::sync::{NamedMutex, Timeout};
    use std::ffi::c_void;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(10);

    fn unique_names() -> RpcNames {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let config = Config::with_namespace(format!(
            "overlay-ipc-rpc-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        RpcNames::new(&config, ProcessId::current()).unwrap()
    }

    fn pair() -> (RpcChannel<OverlayRole>, RpcChannel<MainRole>) {
        let (_, overlay, main) = named_pair();
        (overlay, main)
    }

    fn named_pair() -> (RpcNames, RpcChannel<OverlayRole>, RpcChannel<MainRole>) {
        let names = unique_names();
        let me = PeerProcess::new(ProcessId::current());
        let overlay = RpcChannel::<OverlayRole>::new(RpcResources::create(&names).unwrap(), me, POLL);
        let main = RpcChannel::<MainRole>::new(RpcResources::open(&names).unwrap(), me, POLL);
        (names, overlay, main)
    }

    fn base<T: TypedStructure>(node: &mut T) -> &mut BaseInStructure {
        unsafe { &mut *ptr::from_mut(node).cast::<BaseInStructure>() }
    }

    #[test]
    fn test_round_trip_relocates_between_mappings() {
        let (mut overlay, mut main) = pair();

        let bytes: Vec<u8> = (100..116).collect();
        let mut payload = BinaryPayload {
            size: 16,
            data: bytes.as_ptr(),
            ..Default::default()
        };
        let mut session = SessionCreateInfo {
            system_id: 77,
            ..Default::default()
        };
        let head = link_chain(&mut [base(&mut session), base(&mut payload)]);

        {
            let mut msg = overlay.message().unwrap();
            msg.clear(0x10);
            let root = unsafe { msg.encode_chain(head, CopyMode::Everything) }.unwrap();
            msg.set_root(root);
            assert_eq!(msg.fixup_count(), 2);
        }
        overlay.finish_overlay_request().unwrap();
        assert!(overlay.message().is_err());

        assert_eq!(main.wait_for_overlay_request(), WaitResult::OverlayRequestReady);
        {
            let mut msg = main.message().unwrap();
            assert_eq!(msg.request_type(), 0x10);
            let root = msg.root();
            let payload = unsafe { find_in_chain::<BinaryPayload>(root).unwrap().as_ref() };
            let data = unsafe { std::slice::from_raw_parts(payload.data, 16) };
            assert_eq!(data, bytes.as_slice());
            let session = unsafe { find_in_chain::<SessionCreateInfo>(root).unwrap().as_ref() };
            assert_eq!(session.system_id, 77);
            msg.set_result(-3);
        }
        main.finish_main_response().unwrap();

        assert_eq!(overlay.wait_for_main_response(), WaitResult::MainResponseReady);
        let msg = overlay.message().unwrap();
        assert_eq!(msg.result(), -3);
        let root = msg.root();
        assert!(!root.is_null());
        let payload = unsafe { find_in_chain::<BinaryPayload>(root).unwrap().as_ref() };
        assert_eq!(unsafe { *payload.data.add(15) }, 115);
    }

    #[test]
    fn test_calls_proceed_while_channel_mutex_is_held() {
        let (names, mut overlay, mut main) = named_pair();
        let outsider = NamedMutex::open(names.mutex.clone()).unwrap();
        let _held = outsider.lock(Timeout::Duration(POLL)).unwrap();

        overlay.message().unwrap().clear(3);
        overlay.finish_overlay_request().unwrap();
        assert_eq!(main.wait_for_overlay_request(), WaitResult::OverlayRequestReady);
        main.message().unwrap().set_result(9);
        main.finish_main_response().unwrap();
        assert_eq!(overlay.wait_for_main_response(), WaitResult::MainResponseReady);
        assert_eq!(overlay.message().unwrap().result(), 9);
    }

    #[test]
    fn test_corrupt_ledger_from_peer_fails_wait() {
        let (names, mut overlay, mut main) = named_pair();
        overlay.message().unwrap().clear(4);
        overlay.finish_overlay_request().unwrap();

        // Another mapping scribbles an offset one past the segment's end.
        let segment = Shm::<RpcSegment, Opener>::open(names.shmem.clone()).unwrap();
        let header = unsafe { &mut *segment.header.get() };
        let past_end = ptr::without_provenance::<*mut c_void>(RPC_SHMEM_SIZE);
        assert!(header.ledger.record(ptr::null(), past_end));

        assert_eq!(main.wait_for_overlay_request(), WaitResult::WaitError);
        // The turn arrived; main can still answer.
        assert!(main.message().is_ok());
    }

    #[test]
    fn test_out_of_turn_is_refused() {
        let (mut overlay, mut main) = pair();
        assert!(matches!(main.message(), Err(RpcError::OutOfTurn)));
        assert!(matches!(main.finish_main_response(), Err(RpcError::OutOfTurn)));
        assert_eq!(overlay.poll_peer(POLL), Some(WaitResult::WaitError));
        assert_eq!(main.poll_overlay_request(POLL), None);
    }

    #[test]
    fn test_dead_overlay_ends_main_wait() {
        let names = unique_names();
        let _overlay_side = RpcResources::create(&names).unwrap();
        let mut main = RpcChannel::<MainRole>::new(
            RpcResources::open(&names).unwrap(),
            PeerProcess::new(reaped_pid()),
            POLL,
        );
        assert_eq!(main.wait_for_overlay_request(), WaitResult::OverlayProcessTerminated);
    }

    #[test]
    fn test_dead_main_ends_overlay_wait() {
        let names = unique_names();
        let mut overlay = RpcChannel::<OverlayRole>::new(
            RpcResources::create(&names).unwrap(),
            PeerProcess::new(reaped_pid()),
            POLL,
        );
        overlay.message().unwrap().clear(1);
        overlay.finish_overlay_request().unwrap();

        let started = std::time::Instant::now();
        assert_eq!(overlay.wait_for_main_response(), WaitResult::MainProcessTerminated);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_encode_failure_rolls_back() {
        let (mut overlay, _main) = pair();
        let mut msg = overlay.message().unwrap();
        msg.clear(1);

        let mut nodes: Vec<SessionCreateInfo> = (0..2).map(|_| SessionCreateInfo::default()).collect();
        let mut refs: Vec<&mut BaseInStructure> = nodes.iter_mut().map(|n| base(n)).collect();
        let head = link_chain(&mut refs);
        unsafe { msg.encode_chain(head, CopyMode::Everything) }.unwrap();
        let (used, fixups) = (msg.payload_used(), msg.fixup_count());

        // A chain needing more fixups than remain.
        let mut long: Vec<SessionCreateInfo> =
            (0..MAX_POINTER_FIXUPS).map(|_| SessionCreateInfo::default()).collect();
        let mut long_refs: Vec<&mut BaseInStructure> = long.iter_mut().map(|n| base(n)).collect();
        let long_head = link_chain(&mut long_refs[..60]);
        for _ in 0..2 {
            unsafe { msg.encode_chain(long_head, CopyMode::Everything) }.unwrap();
        }
        let before = (msg.payload_used(), msg.fixup_count());
        assert!(matches!(
            unsafe { msg.encode_chain(long_head, CopyMode::Everything) },
            Err(RpcError::Codec(crate::chain::CodecError::LedgerFull))
        ));
        assert_eq!((msg.payload_used(), msg.fixup_count()), before);
        assert!(before.0 > used && before.1 > fixups);
    }

    #[test]
    fn test_record_pointer_outside_payload_is_rejected() {
        let (mut overlay, _main) = pair();
        let mut msg = overlay.message().unwrap();
        msg.clear(1);
        let local: *const u8 = ptr::null();
        assert!(msg.record_pointer(&raw const local).is_err());

        let slot = msg.write_value::<*const u8>(ptr::null()).unwrap();
        assert!(msg.record_pointer(slot.as_ptr().cast_const()).is_ok());
        assert_eq!(msg.fixup_count(), 1);
    }
}
