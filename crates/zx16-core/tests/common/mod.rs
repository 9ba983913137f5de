//! Fake simulator used by the lifecycle tests.
//!
//! A POSIX sh stand-in for `z16sim` that speaks the same stdio protocol:
//! banner, a disassembly line per cycle, `q` to quit, and exit 0 once
//! `ecall 3` halts the program. Like the real simulator, only interactive
//! mode prints `READY_FOR_STEP` and register dumps. It decodes just enough
//! of ZX16 (`li`, `add`, `ecall 3`) to make register checks real.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use zx16_core::{LocalToolchain, SimulatorConfig, Supervisor};

/// `li a0, 2`
pub const LI_A0_2: [u8; 2] = [0xB9, 0x05];
/// `li a1, 3`
pub const LI_A1_3: [u8; 2] = [0xF9, 0x07];
/// `add a0, a1`
pub const ADD_A0_A1: [u8; 2] = [0x80, 0x0F];
/// `ecall 3`
pub const ECALL_EXIT: [u8; 2] = [0xC7, 0x00];

pub fn program(instructions: &[[u8; 2]]) -> Vec<u8> {
    instructions.iter().flatten().copied().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Stops responding after the first step command
    Hang,
    /// Dies with a non-zero status on the first step command
    Crash,
    /// Sleeps before every step
    Slow,
}

impl Behavior {
    fn as_str(self) -> &'static str {
        match self {
            Behavior::Normal => "normal",
            Behavior::Hang => "hang",
            Behavior::Crash => "crash",
            Behavior::Slow => "slow",
        }
    }
}

const FAKE_SIM: &str = r#"
if [ "$1" = "-i" ]; then interactive=1; file=$2; else interactive=0; file=$1; fi
if [ ! -r "$file" ]; then echo "Error: Could not open file $file" >&2; exit 1; fi
echo $$ > "$(dirname "$0")/sim.pid"

set -- $(od -An -v -tu1 "$file")
n=0
while [ $# -ge 2 ]; do
  eval "w$n=$(( $1 | ($2 << 8) ))"
  n=$((n+1))
  shift 2
done

r0=0; r1=0; r2=0; r3=0; r4=0; r5=0; r6=0; r7=0
pc=0

dump() {
  echo "--- Registers ---"
  i=0
  for name in t0 ra sp s0 s1 t1 a0 a1; do
    eval "v=\$r$i"
    s=$v
    if [ $s -ge 32768 ]; then s=$((s-65536)); fi
    printf '  %s (x%d): 0x%04x (%d)\n' "$name" "$i" "$v" "$s"
    i=$((i+1))
  done
  echo "-----------------"
}

cycle() {
  if [ $pc -ge $n ]; then
    echo "Program Counter out of bounds. Simulation halted." >&2
    return 1
  fi
  eval "w=\$w$pc"
  pc=$((pc+1))
  op=$((w & 7)); f3=$(((w >> 3) & 7)); rd=$(((w >> 6) & 7))
  rs2=$(((w >> 9) & 7)); f4=$(((w >> 12) & 15))
  if [ $op -eq 1 ] && [ $f3 -eq 7 ]; then
    imm=$(((w >> 9) & 127))
    if [ $imm -ge 64 ]; then imm=$((imm-128)); fi
    echo "li x$rd, $imm"
    eval "r$rd=$((imm & 65535))"
  elif [ $op -eq 0 ] && [ $f3 -eq 0 ] && [ $f4 -eq 0 ]; then
    echo "add x$rd, x$rs2"
    eval "r$rd=\$(( (r$rd + r$rs2) & 65535 ))"
  elif [ $op -eq 7 ] && [ $f3 -eq 0 ] && [ $rd -eq 3 ]; then
    echo "ecall 3"
    debug_dump
    return 1
  else
    echo "Unknown instruction"
    debug_dump
    return 1
  fi
  debug_dump
  return 0
}

debug_dump() {
  if [ $interactive -eq 1 ]; then dump; fi
}

echo "Loaded machine code from $file"
if [ $interactive -eq 0 ]; then
  echo "Starting full simulation..."
  while cycle; do :; done
  echo "Full simulation finished."
  exit 0
fi

echo "Starting interactive simulation."
dump
echo READY_FOR_STEP
while IFS= read -r line; do
  case "$line" in
    q|Q) echo "Quitting interactive simulation as requested."; exit 0 ;;
  esac
  case "$BEHAVIOR" in
    hang) exec sleep 30 ;;
    crash) echo "Segmentation fault at pc=$pc" >&2; exit 3 ;;
    slow) sleep 0.3 ;;
  esac
  if ! cycle; then
    echo "Simulation halted."
    exit 0
  fi
  echo READY_FOR_STEP
done
echo "Input stream closed unexpectedly." >&2
exit 0
"#;

/// Scratch space for one test: the fake simulator and a separate upload dir.
pub struct Harness {
    pub bin_dir: TempDir,
    pub upload_dir: TempDir,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_config(behavior, |config| config)
    }

    pub fn with_config(
        behavior: Behavior,
        tweak: impl FnOnce(SimulatorConfig) -> SimulatorConfig,
    ) -> Self {
        let bin_dir = TempDir::new().unwrap();
        let upload_dir = TempDir::new().unwrap();
        let exe = write_fake_sim(bin_dir.path(), behavior);

        let config = tweak(
            SimulatorConfig::new(exe)
                .upload_dir(upload_dir.path())
                .command_timeouts(Duration::from_secs(3), Duration::from_secs(3))
                .grace_period(Duration::from_millis(400)),
        );
        let gateway = Arc::new(LocalToolchain::from_config(&config));
        let supervisor = Arc::new(Supervisor::new(config, gateway));

        Self {
            bin_dir,
            upload_dir,
            supervisor,
        }
    }

    /// Number of image files still on disk.
    pub fn stored_images(&self) -> usize {
        std::fs::read_dir(self.upload_dir.path()).unwrap().count()
    }

    /// PID of the most recently launched fake simulator.
    pub fn last_pid(&self) -> i32 {
        std::fs::read_to_string(self.bin_dir.path().join("sim.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }
}

fn write_fake_sim(dir: &Path, behavior: Behavior) -> PathBuf {
    let path = dir.join("z16sim");
    let script = format!("#!/bin/sh\nBEHAVIOR={}\n{}", behavior.as_str(), FAKE_SIM);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// True while `pid` exists (reaped processes report false).
pub fn process_exists(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
