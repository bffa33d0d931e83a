//! VFS boot tests (run against the mounted root filesystem).

use orion_ktest::kernel_test;

#[kernel_test(stage = "with_sched")]
fn root_resolves() {
    let root = crate::fs::vfs::root_ventry().expect("root mounted");
    let resolved = crate::fs::vresolve(&root, "/", crate::fs::VrFlags::DIR);
    assert!(resolved.is_ok(), "root did not resolve");
}

#[kernel_test(stage = "with_sched")]
fn dev_console_exists() {
    use orion_syscall::flags::{OpenFlags, S_IFCHR, S_IFMT};

    let file = match crate::fs::kopen("/dev/console", OpenFlags::O_RDWR) {
        Ok(f) => f,
        // A root filesystem without devfs support skips the check.
        Err(_) => return,
    };
    let stat = file.stat().expect("stat console");
    assert_eq!(stat.st_mode & S_IFMT, S_IFCHR);
    assert_eq!(
        orion_syscall::Stat::split_rdev(stat.st_rdev).0,
        crate::drivers::CONSOLE_MAJOR
    );
    file.write(b"ktest: console says hi\n").expect("console write");
}
