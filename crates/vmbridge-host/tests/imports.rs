//! Integration tests for the host imports.
//!
//! Guests here emulate the asyncify runtime with globals so `keydown` can
//! suspend them exactly like a transformed guest.

use vmbridge_common::{BridgeConfig, BridgeError, EngineConfig, HostFunctionError, KeydownPolicy};
use vmbridge_core::{BridgeChannels, CompiledModule, GuestInstance, WasmEngine, create_store};
use vmbridge_host::build_linker;

const CONTROLS: &str = r#"
    (global $state (mut i32) (i32.const 0))
    (global $data (mut i32) (i32.const 0))

    (func (export "asyncify_get_state") (result i32) (global.get $state))
    (func (export "asyncify_start_unwind") (param $addr i32)
        (global.set $data (local.get $addr))
        (global.set $state (i32.const 1)))
    (func (export "asyncify_stop_unwind")
        (global.set $state (i32.const 0)))
    (func (export "asyncify_start_rewind") (param $addr i32)
        (global.set $data (local.get $addr))
        (global.set $state (i32.const 2)))
    (func (export "asyncify_stop_rewind")
        (global.set $state (i32.const 0)))
"#;

/// Echoes one waiting input code per step.
fn echo_guest() -> String {
    format!(
        r#"
        (module
            (import "env" "keydown" (func $keydown (result i32)))
            (import "env" "rx" (func $rx (result i32)))
            (import "env" "tx" (func $tx (param i32)))
            (memory (export "memory") 1)
            {CONTROLS}

            (func (export "step")
                (local $k i32)
                (if (i32.eq (global.get $state) (i32.const 2))
                    (then
                        (i32.store (global.get $data)
                            (i32.sub (i32.load (global.get $data)) (i32.const 4)))))
                (local.set $k (call $keydown))
                (if (i32.eq (global.get $state) (i32.const 1))
                    (then
                        (i32.store (global.get $data)
                            (i32.add (i32.load (global.get $data)) (i32.const 4)))
                        (return)))
                (if (local.get $k)
                    (then (call $tx (call $rx)))))
        )
        "#
    )
}

fn start(wat: &str, policy: KeydownPolicy) -> (GuestInstance, BridgeChannels) {
    let mut config = BridgeConfig::default();
    config.io.keydown_policy = policy;

    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let linker = build_linker(engine.inner()).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    let (store, channels) = create_store(&engine, &config, "host-test".into());

    let guest = GuestInstance::instantiate(&linker, &module, store, &config.asyncify).unwrap();
    (guest, channels)
}

fn drain(channels: &mut BridgeChannels) -> String {
    let mut out = String::new();
    while let Ok(code) = channels.output.try_recv() {
        out.extend(char::from_u32(code));
    }
    out
}

#[tokio::test]
async fn test_echo_with_poll_policy() {
    let (mut guest, mut channels) = start(&echo_guest(), KeydownPolicy::Poll);

    channels.input.send_str("hi").unwrap();
    for _ in 0..3 {
        guest.call_export("step", &[]).await.unwrap();
    }

    assert_eq!(drain(&mut channels), "hi");
    assert_eq!(guest.context().bridge().suspensions(), 0);
    assert_eq!(guest.context().metrics.bytes_in, 2);
    assert_eq!(guest.context().metrics.bytes_out, 2);
}

#[tokio::test]
async fn test_echo_with_suspend_policy() {
    let (mut guest, mut channels) = start(&echo_guest(), KeydownPolicy::Suspend);

    // Nothing queued: keydown suspends, gives up and reports no input
    guest.call_export("step", &[]).await.unwrap();
    assert_eq!(guest.context().bridge().suspensions(), 1);
    assert_eq!(drain(&mut channels), "");

    channels.input.send_char('q').unwrap();
    guest.call_export("step", &[]).await.unwrap();

    assert_eq!(drain(&mut channels), "q");
    // Queued input is answered without suspending
    assert_eq!(guest.context().bridge().suspensions(), 1);
    assert_eq!(guest.scratch_header().unwrap(), guest.scratch());
}

#[tokio::test]
async fn test_suspended_keydown_sees_input_sent_meanwhile() {
    let (mut guest, mut channels) = start(&echo_guest(), KeydownPolicy::Suspend);

    let input = channels.input.clone();
    let sender = tokio::spawn(async move { input.send_char('z').unwrap() });

    guest.call_export("step", &[]).await.unwrap();
    sender.await.unwrap();
    guest.call_export("step", &[]).await.unwrap();

    assert_eq!(drain(&mut channels), "z");
}

#[tokio::test]
async fn test_rx_without_keydown_is_a_fault() {
    let wat = format!(
        r#"
        (module
            (import "env" "rx" (func $rx (result i32)))
            (memory (export "memory") 1)
            {CONTROLS}
            (func (export "step") (result i32) (call $rx))
        )
        "#
    );
    let (mut guest, _channels) = start(&wat, KeydownPolicy::Poll);

    let err = guest.call_export("step", &[]).await.unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::HostFunction(HostFunctionError::InputQueueEmpty)
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_ready_flips_through_tx() {
    let wat = format!(
        r#"
        (module
            (import "env" "tx" (func $tx (param i32)))
            (memory (export "memory") 1)
            {CONTROLS}
            (func (export "step") (param $c i32) (call $tx (local.get $c)))
        )
        "#
    );
    let (mut guest, mut channels) = start(&wat, KeydownPolicy::Poll);

    for c in "login:".chars() {
        assert!(!*channels.ready.borrow());
        #[allow(clippy::cast_possible_wrap)]
        let param = wasmtime::Val::I32(u32::from(c) as i32);
        guest.call_export("step", &[param]).await.unwrap();
    }

    assert!(*channels.ready.borrow_and_update());
    assert!(guest.context().is_ready());
    assert_eq!(drain(&mut channels), "login:");
}

#[tokio::test]
async fn test_timer_imports() {
    let wat = format!(
        r#"
        (module
            (import "env" "elapsed_us" (func $elapsed (result f64)))
            (import "env" "wait" (func $wait (param i32)))
            (memory (export "memory") 1)
            {CONTROLS}
            (func (export "step") (result f64)
                (drop (call $elapsed))
                (call $wait (i32.const 1500))
                (call $elapsed))
        )
        "#
    );
    let (mut guest, _channels) = start(&wat, KeydownPolicy::Poll);

    let results = guest.call_export("step", &[]).await.unwrap();
    let elapsed = results[0].unwrap_f64();

    assert!(elapsed >= 1_500.0, "elapsed = {elapsed}");
    assert_eq!(guest.context().metrics.waits, 1);
}
