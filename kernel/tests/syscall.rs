use kernel::{
    Kernel, KernelError, SystemConfigurationBuilder,
    addressing::{PAGE_SIZE, Va},
    mm::noff::{ImageBuilder, NoffHeader},
    process::{self, ExecPolicy, JOIN_FAILED},
    syscall::{SyscallAbi, SyscallNumber},
    user::UserContext,
};
use machine::spinlock::SpinLock;
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    boot_with_input(b"")
}

fn boot_with_input(input: &[u8]) -> Arc<Kernel> {
    Kernel::boot(
        SystemConfigurationBuilder::new()
            .set_quiet(true)
            .set_console_input(input)
            .build(),
    )
}

fn image() -> Vec<u8> {
    ImageBuilder::new()
        .code(&[0; 64])
        .uninit_data(2 * PAGE_SIZE as u32)
        .build()
}

fn install(
    kernel: &Kernel,
    path: &str,
    program: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static,
) {
    kernel.install(path, &image(), program).unwrap();
}

/// Run `path` as a joinable process and return its exit status.
fn run_joined(kernel: &Arc<Kernel>, path: &'static str) -> i32 {
    let mut status = None;
    kernel.run(|| {
        let id = process::exec(path, &[], ExecPolicy::JOINABLE).unwrap();
        status = Some(process::join(id));
    });
    status.unwrap()
}

/// Tests that the exit status of a child reaches its parent.
///
/// This test ensures that:
/// - Exec returns a positive SpaceId.
/// - Join returns the status the child exited with.
#[test]
fn join_returns_exit_status() {
    let kernel = boot();
    install(&kernel, "child", |_| 42);
    install(&kernel, "parent", |ctx| {
        let id = ctx.exec("child", &[], ExecPolicy::JOINABLE);
        if id <= 0 {
            return -100;
        }
        ctx.join(id) + 1
    });
    assert_eq!(run_joined(&kernel, "parent"), 43);
}

/// Tests that an explicit Exit behaves like returning from the program.
#[test]
fn explicit_exit() {
    let kernel = boot();
    install(&kernel, "quitter", |ctx| ctx.exit(9));
    assert_eq!(run_joined(&kernel, "quitter"), 9);
}

/// Tests that arguments reach the program, name first.
#[test]
fn shell_passes_arguments() {
    let kernel = boot();
    install(&kernel, "echo", |ctx| {
        let args = ctx.args();
        if args.first().map(String::as_str) != Some("echo") {
            return 1;
        }
        let line = format!("{}\n", args[1..].join(" "));
        ctx.print(&line);
        0
    });
    install(&kernel, "shell", |ctx| {
        let id = ctx.exec("echo", &["hello", "world"], ExecPolicy::JOINABLE);
        ctx.join(id)
    });
    assert_eq!(run_joined(&kernel, "shell"), 0);
    assert_eq!(kernel.console_output(), "hello world\n");
}

fn install_pipeline(kernel: &Kernel) {
    install(kernel, "produce", |ctx| {
        ctx.print("hello");
        0
    });
    install(kernel, "caesar", |ctx| {
        loop {
            let chunk = ctx.input(4);
            if chunk.is_empty() {
                return 0;
            }
            let shifted = chunk
                .iter()
                .map(|c| (b'a' + (c - b'a' + 3) % 26) as char)
                .collect::<String>();
            ctx.print(&shifted);
        }
    });
    install(kernel, "consume", |ctx| {
        let mut all = Vec::new();
        loop {
            let chunk = ctx.input(16);
            if chunk.is_empty() {
                break;
            }
            all.extend(chunk);
        }
        ctx.print(&String::from_utf8_lossy(&all));
        all.len() as i32
    });
}

/// Tests a pipeline of three processes.
///
/// This test ensures that:
/// - The output of a process feeds the input of the next.
/// - The middle process reads and writes pipes at once.
/// - Readers see the end of the stream once the writer exits.
#[test]
fn pipeline_of_three() {
    let kernel = boot();
    install_pipeline(&kernel);
    kernel.run(|| {
        let joinable = ExecPolicy::JOINABLE;
        let ids = [
            process::exec("produce", &[], joinable | ExecPolicy::OUTPUT_PIPE),
            process::exec(
                "caesar",
                &[],
                joinable | ExecPolicy::INPUT_PIPE | ExecPolicy::OUTPUT_PIPE,
            ),
            process::exec("consume", &[], joinable | ExecPolicy::INPUT_PIPE),
        ]
        .map(Result::unwrap);
        let statuses = ids.map(process::join);
        assert_eq!(statuses, [0, 0, 5]);
    });
    assert_eq!(kernel.console_output(), "khoor");
}

/// Tests a direct pipe between a producer and a consumer.
#[test]
fn producer_to_consumer() {
    let kernel = boot();
    install_pipeline(&kernel);
    kernel.run(|| {
        let producer = process::exec(
            "produce",
            &[],
            ExecPolicy::JOINABLE | ExecPolicy::OUTPUT_PIPE,
        )
        .unwrap();
        let consumer =
            process::exec("consume", &[], ExecPolicy::JOINABLE | ExecPolicy::INPUT_PIPE)
                .unwrap();
        assert_eq!(process::join(consumer), 5);
        assert_eq!(process::join(producer), 0);
    });
    assert_eq!(kernel.console_output(), "hello");
}

/// Tests that exec rejects what it cannot run.
#[test]
fn exec_failures() {
    let kernel = boot();
    kernel
        .machine
        .storage
        .write_file("junk", b"definitely not an executable")
        .unwrap();
    kernel
        .install("corrupt", b"garbage header", |_| 0)
        .unwrap();
    let patched = |patch: fn(&mut NoffHeader)| {
        let mut image = image();
        let mut header = NoffHeader::parse(&image).unwrap();
        patch(&mut header);
        image[..NoffHeader::SIZE].copy_from_slice(&header.to_bytes());
        image
    };
    let inconsistent: [(&str, fn(&mut NoffHeader)); 3] = [
        ("overrun", |h| h.code.in_file_addr = 10_000),
        ("scattered", |h| h.uninit_data.virtual_addr = 0x10_0000),
        ("huge", |h| h.uninit_data.size = u32::MAX),
    ];
    for (path, patch) in inconsistent {
        kernel.install(path, &patched(patch), |_| 0).unwrap();
    }
    kernel.run(|| {
        assert_eq!(
            process::exec("missing", &[], ExecPolicy::JOINABLE),
            Err(KernelError::NoSuchEntry)
        );
        assert_eq!(
            process::exec("junk", &[], ExecPolicy::JOINABLE),
            Err(KernelError::NoExec)
        );
        assert_eq!(
            process::exec("corrupt", &[], ExecPolicy::JOINABLE),
            Err(KernelError::NoExec)
        );
        assert_eq!(
            process::exec(&"p".repeat(101), &[], ExecPolicy::JOINABLE),
            Err(KernelError::NameTooLong)
        );
        for path in ["overrun", "scattered", "huge"] {
            assert_eq!(
                process::exec(path, &[], ExecPolicy::JOINABLE),
                Err(KernelError::NoExec),
                "`{path}` must be rejected."
            );
        }
    });
    // No store leaked by the failed attempts.
    assert!(!kernel.machine.storage.exists("swap.0"));
}

/// Tests the error numbers returned to user programs.
///
/// This test ensures that:
/// - A missing executable gives -2.
/// - An argument that is too long gives -7.
/// - A path that is too long gives -36.
/// - A buffer outside of the address space gives -14.
/// - A file descriptor other than the console gives -9.
#[test]
fn error_numbers() {
    let kernel = boot();
    install(&kernel, "echo", |_| 0);
    install(&kernel, "checker", |ctx| {
        let long_arg = "a".repeat(60);
        let long_path = "p".repeat(150);
        let outside = Va::new(ctx.space().size() + PAGE_SIZE);
        let results = [
            ctx.exec("missing", &[], ExecPolicy::JOINABLE),
            ctx.exec("echo", &[long_arg.as_str()], ExecPolicy::JOINABLE),
            ctx.exec(&long_path, &[], ExecPolicy::JOINABLE),
            ctx.read(outside, 4),
            ctx.write(outside, 4),
            ctx.syscall(SyscallAbi::new(SyscallNumber::Write, [0, 1, 2, 0])),
            ctx.syscall(SyscallAbi::new(SyscallNumber::Read, [0, 1, 1, 0])),
        ];
        let expected = [-2, -7, -36, -14, -14, -9, -9];
        match results.iter().zip(expected).position(|(r, e)| *r != e) {
            Some(i) => i as i32 + 1,
            None => 0,
        }
    });
    assert_eq!(run_joined(&kernel, "checker"), 0);
}

/// Tests that Exec checks its argument vector before walking it.
///
/// This test ensures that:
/// - An argument count that cannot fit in the argument area gives -7
///   instead of crashing the kernel.
/// - An argument vector that wraps around the address space gives -14.
#[test]
fn exec_rejects_bogus_argument_vector() {
    let kernel = boot();
    install(&kernel, "echo", |_| 0);
    install(&kernel, "greedy", |ctx| {
        let path = ctx.push_str("echo").into_usize();
        let results = [
            ctx.syscall(SyscallAbi::new(
                SyscallNumber::Exec,
                [path, usize::MAX / 2, 0, 0],
            )),
            ctx.syscall(SyscallAbi::new(
                SyscallNumber::Exec,
                [path, 1, usize::MAX - 1, 0],
            )),
        ];
        match results.iter().zip([-7, -14]).position(|(r, e)| *r != e) {
            Some(i) => i as i32 + 1,
            None => 0,
        }
    });
    assert_eq!(run_joined(&kernel, "greedy"), 0);
}

/// Tests that an illegal memory access kills the process with -1.
#[test]
fn address_error_exits() {
    let kernel = boot();
    install(&kernel, "wild", |ctx| {
        let far = Va::new(ctx.space().size() + 16);
        ctx.load_u8(far);
        0
    });
    install(&kernel, "misaligned", |ctx| {
        ctx.load_u32(Va::new(2));
        0
    });
    kernel.run(|| {
        for path in ["wild", "misaligned"] {
            let id = process::exec(path, &[], ExecPolicy::JOINABLE).unwrap();
            assert_eq!(process::join(id), -1, "`{path}` must die.");
        }
    });
}

/// Tests that an unknown system call kills the process with -1.
#[test]
fn unknown_syscall_exits() {
    let kernel = boot();
    install(&kernel, "bogus", |ctx| {
        ctx.syscall(SyscallAbi {
            sysno: 42,
            ..Default::default()
        });
        0
    });
    assert_eq!(run_joined(&kernel, "bogus"), -1);
}

/// Tests console reads and writes from user programs.
///
/// This test ensures that:
/// - Write returns the number of bytes written.
/// - Read returns what the console delivered, short at the end of input.
#[test]
fn console_round_trip() {
    let kernel = boot_with_input(b"xyz");
    install(&kernel, "cat", |ctx| {
        let input = ctx.input(8);
        let written = ctx.print(&String::from_utf8_lossy(&input));
        if written != 3 {
            return -2;
        }
        input.len() as i32
    });
    assert_eq!(run_joined(&kernel, "cat"), 3);
    assert_eq!(kernel.console_output(), "xyz");
    assert_eq!(kernel.machine.stats.snapshot().console_chars_read, 3);
}

/// Tests that forked threads share the memory of their process.
#[test]
fn fork_shares_memory() {
    let kernel = boot();
    install(&kernel, "forker", |ctx| {
        let flag = Va::new(64);
        ctx.store_u32(flag, 0);
        let id = ctx.fork(move |ctx| {
            ctx.store_u32(flag, 7);
            0
        });
        if id <= 0 {
            return -1;
        }
        for _ in 0..100 {
            let value = ctx.load_u32(flag);
            if value != 0 {
                return value as i32;
            }
            ctx.yield_now();
        }
        -2
    });
    assert_eq!(run_joined(&kernel, "forker"), 7);
    assert_eq!(kernel.resident_pages(), 0, "The shared space must be gone.");
}

/// Tests that a user program can stop the machine.
#[test]
fn halt_from_user() {
    let kernel = boot();
    install(&kernel, "halter", |ctx| {
        ctx.print("bye");
        ctx.halt()
    });
    let mut joined = false;
    kernel.run(|| {
        let id = process::exec("halter", &[], ExecPolicy::JOINABLE).unwrap();
        process::join(id);
        joined = true;
    });
    assert!(!joined, "Halt must stop the run.");
    assert_eq!(kernel.console_output(), "bye");
}

/// Tests the cases where Join fails.
///
/// This test ensures that:
/// - Ids that name no process fail.
/// - A process started without the joinable policy cannot be joined.
/// - A process can be joined only once.
#[test]
fn join_failures() {
    let kernel = boot();
    install(&kernel, "child", |_| 5);
    kernel.run(|| {
        assert_eq!(process::join(0), JOIN_FAILED);
        assert_eq!(process::join(999), JOIN_FAILED);

        let detached = process::exec("child", &[], ExecPolicy::empty()).unwrap();
        assert_eq!(process::join(detached), JOIN_FAILED);

        let id = process::exec("child", &[], ExecPolicy::JOINABLE).unwrap();
        assert_eq!(process::join(id), 5);
        assert_eq!(process::join(id), JOIN_FAILED);
    });
}

/// Tests that SpaceIds are reused once their process is gone.
#[test]
fn space_ids_are_recycled() {
    let kernel = boot();
    install(&kernel, "child", |_| 0);
    kernel.run(|| {
        let first = process::exec("child", &[], ExecPolicy::JOINABLE).unwrap();
        assert_eq!(first, 1);
        process::join(first);
        let second = process::exec("child", &[], ExecPolicy::JOINABLE).unwrap();
        assert_eq!(second, first);
        process::join(second);
    });
}

/// Tests preemption of user code by the timer.
///
/// Neither program blocks, so they only interleave if the time slice
/// expires.
#[test]
fn time_slice_interleaves_processes() {
    let kernel = Kernel::boot(
        SystemConfigurationBuilder::new()
            .set_quiet(true)
            .set_time_slice(50)
            .build(),
    );
    let log = Arc::new(SpinLock::new(String::new()));
    for path in ["a", "b"] {
        let log = log.clone();
        install(&kernel, path, move |ctx| {
            for _ in 0..4 {
                ctx.load_bytes(Va::new(0), 64);
                let mut log = log.lock();
                log.push_str(path);
                log.unlock();
            }
            0
        });
    }
    kernel.run(|| {
        let a = process::exec("a", &[], ExecPolicy::JOINABLE).unwrap();
        let b = process::exec("b", &[], ExecPolicy::JOINABLE).unwrap();
        assert_eq!(process::join(a), 0);
        assert_eq!(process::join(b), 0);
    });
    let log = log.lock();
    let order = log.clone();
    log.unlock();
    assert_eq!(order.len(), 8);
    assert_ne!(order, "aaaabbbb", "User code was never preempted.");
}
