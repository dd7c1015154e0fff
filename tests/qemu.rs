//! QEMU-hosted integration tests.
//!
//! Builds the `icevmm` image for `aarch64-unknown-none`, boots it under
//! `qemu-system-aarch64 -M virt`, and scrapes the PL011 UART output over
//! `-serial stdio`, mirroring the way the teacher repository's own `xtask`
//! drives `qemu-system-aarch64` for its kernel. Gated behind the
//! `qemu-tests` feature so a plain `cargo test` on a host target never even
//! compiles this file (`#![cfg(feature = "qemu-tests")]` below), since it
//! needs a real `aarch64-unknown-none` toolchain and a `qemu-system-aarch64`
//! binary on `PATH`.
//!
//! The embedded guest payload (`src/guest_payload.rs`) is fixed at build
//! time to the "hello HVC" scenario (spec.md E1), so this file exercises
//! that scenario end-to-end, which also covers testable properties 6
//! (MMIO write emulation) and 7 (HVC handling) together: the payload does
//! a `strb` to the UART page before its `hvc #0`. Scenarios E2-E4 each need
//! a different guest payload than the one shipped in this image, and E5
//! needs a firmware/boot configuration that lands below EL2; none of
//! those are exercised here.

#![cfg(feature = "qemu-tests")]

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Builds the release image and returns the path to the raw binary
/// `build.rs` produces (release profile links `--oformat=binary
/// --strip-all`, so this is already flat, not an ELF).
fn build_image() -> PathBuf {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(&cargo)
        .args(["build", "--release", "--target", "aarch64-unknown-none", "--bin", "icevmm"])
        .status()
        .expect("failed to spawn cargo build");
    assert!(status.success(), "building the icevmm image failed");

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target/aarch64-unknown-none/release/icevmm")
}

/// Boots `image` under QEMU's `virt` machine and returns everything written
/// to the emulated UART within `timeout`. The guest payloads this crate
/// ships never request a clean exit on their own (E1's payload ends in
/// `b .`), so unlike `machine::qemu_shutdown`'s fatal-path exit, success
/// here is detected by polling for expected output and then killing QEMU,
/// not by waiting for the process to exit.
fn run_under_qemu(image: &std::path::Path, timeout: Duration) -> String {
    let mut qemu = Command::new("qemu-system-aarch64")
        .args([
            "-M", "virt",
            "-cpu", "cortex-a57",
            "-m", "512M",
            "-display", "none",
            "-serial", "stdio",
            "-kernel",
        ])
        .arg(image)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn qemu-system-aarch64 (is it on PATH?)");

    let mut stdout = qemu.stdout.take().expect("piped stdout");

    // A blocking `read` never returns for a guest that loops forever
    // without closing its end of the pipe, so the read happens on its own
    // thread and the deadline is enforced here by killing QEMU instead
    // (which closes the pipe and unblocks the reader thread).
    let reader = std::thread::spawn(move || {
        let mut output = Vec::new();
        let mut chunk = [0_u8; 4096];
        while let Ok(n) = stdout.read(&mut chunk) {
            if n == 0 {
                break;
            }
            output.extend_from_slice(&chunk[..n]);
        }
        output
    });

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(_status) = qemu.try_wait().expect("polling qemu's exit status") {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let _ = qemu.kill();
    let _ = qemu.wait();
    let output = reader.join().expect("reader thread panicked");
    String::from_utf8_lossy(&output).into_owned()
}

#[test]
fn e1_hello_hvc_prints_and_does_not_fault() {
    let image = build_image();
    let output = run_under_qemu(&image, Duration::from_secs(10));

    assert!(output.contains("icevmm: booting at EL2"), "boot banner missing:\n{output}");
    assert!(output.contains("icevmm: stage-2 MMU enabled"), "stage-2 bring-up missing:\n{output}");
    assert!(output.contains('G'), "expected the guest's 'G' byte on the UART:\n{output}");
    assert_eq!(
        output.matches("icevmm: HVC from guest").count(),
        1,
        "the guest's single hvc #0 should log exactly once:\n{output}"
    );
    assert!(
        !output.contains("icevmm: fatal"),
        "hypervisor reported a fatal condition:\n{output}"
    );
}

#[test]
fn boot_sequence_reaches_the_scheduler_before_any_trap_is_serviced() {
    let image = build_image();
    let output = run_under_qemu(&image, Duration::from_secs(10));

    let scheduler_pos = output.find("icevmm: scheduler starting").expect("scheduler banner missing");
    let hvc_pos = output.find('G');
    if let Some(hvc_pos) = hvc_pos {
        assert!(
            scheduler_pos < hvc_pos,
            "the scheduler must start before the guest can have run far enough to trap:\n{output}"
        );
    }
}
