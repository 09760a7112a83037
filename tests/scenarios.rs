//! End-to-end scenarios exercised against the host-testable mock port.
//!
//! All tests drive one process-wide [`Scheduler`] instance, so they are
//! marked `#[sequential]` and each starts by resetting it, the same
//! discipline the teacher's own task-manager integration suite follows.
use jrtos_core::ports::mock::MockPort;
use jrtos_core::scheduler::Scheduler;
use jrtos_core::semaphore::Semaphore;
use jrtos_core::task::{init_task, State, Task};
use sequential_test::sequential;
use std::sync::Mutex;
use std::sync::OnceLock;

extern "C" fn dummy(_arg: usize) {}

fn scheduler() -> std::sync::MutexGuard<'static, Scheduler<MockPort>> {
    static SCHEDULER: OnceLock<Mutex<Scheduler<MockPort>>> = OnceLock::new();
    let guard = SCHEDULER
        .get_or_init(|| Mutex::new(Scheduler::new(MockPort::new())))
        .lock()
        .unwrap();
    guard
}

#[test]
#[sequential]
fn priority_zero_task_keeps_the_cpu_across_yields() {
    let mut sched = scheduler();
    sched.reset();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut low = Task::new();
    init_task(&mut low, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut low as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    for _ in 0..10 {
        let next = sched.yield_task(&mut main);
        assert_eq!(next, main_ptr, "the only ACTIVE, highest-priority task keeps running");
    }

    let next = sched.end_task(&mut main);
    assert_eq!(next, &mut low as *mut Task);
    assert_eq!(main.state(), State::End);
    assert_eq!(low.state(), State::Active);
}

#[test]
#[sequential]
fn producer_consumer_semaphore_delivers_every_signal() {
    let mut sched = scheduler();
    sched.reset();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut consumer = Task::new();
    init_task(&mut consumer, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut consumer as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    let sem = Semaphore::new(0);
    for _ in 0..5 {
        sem.signal(&mut sched);
    }
    assert_eq!(sem.value(), 5);

    let mut consumed = 0;
    for _ in 0..5 {
        sem.wait(&mut sched, &mut consumer);
        consumed += 1;
    }
    assert_eq!(consumed, 5);
    assert_eq!(sem.value(), 0);

    // The sixth wait blocks: no permit and no waiter was pre-registered.
    sem.wait(&mut sched, &mut consumer);
    assert_eq!(sem.value(), -1);
    assert_eq!(consumer.state(), State::WaitFor);
}

#[test]
#[sequential]
fn sleep_reaches_active_at_exactly_the_configured_tick() {
    let mut sched = scheduler();
    sched.reset();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut sleeper = Task::new();
    init_task(&mut sleeper, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut sleeper as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    sched.sleep_ms_task(&mut sleeper, 100);
    assert_eq!(sleeper.state(), State::Sleep);

    for _ in 0..99 {
        let woke = sched.periodic(1);
        assert_eq!(woke, 0);
    }
    assert_eq!(sleeper.state(), State::Sleep);

    let woke = sched.periodic(1);
    assert_eq!(woke, 1);

    // The wake is posted to `wakeupmask`; a scheduling point promotes it.
    let _ = sched.yield_task(&mut main);
    assert_eq!(sleeper.state(), State::Active);
}

#[test]
#[sequential]
fn stop_task_ends_a_task_blocked_in_waitfor() {
    let mut sched = scheduler();
    sched.reset();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut waiter = Task::new();
    init_task(&mut waiter, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut waiter as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    let sem = Semaphore::new(0);
    sem.wait(&mut sched, &mut waiter);
    assert_eq!(waiter.state(), State::WaitFor);

    let waiter_id = waiter.id();
    sched.stop_task(&mut waiter);
    sem.signal(&mut sched);

    assert_eq!(waiter.state(), State::End);
    let _ = waiter_id;
}

#[test]
#[sequential]
fn resume_qd_task_from_interrupt_context_does_not_preempt() {
    let mut sched = scheduler();
    sched.reset();
    sched.port_mut().reset_observations();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut low = Task::new();
    init_task(&mut low, 5, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let low_ptr = &mut low as *mut Task;
    let mut tasks = [main_ptr, low_ptr];
    sched.init(&mut tasks, main_ptr).unwrap();

    // `low` suspends itself; with only `main` left runnable, `main` is
    // selected.
    let next = sched.suspend_task(&mut low);
    assert_eq!(next, main_ptr);
    assert_eq!(low.state(), State::Suspend);

    // An interrupt resumes `low` without yielding. The resume is deferred:
    // `low` is not promoted until the next scheduling point.
    sched.resume_qd_task(&mut low).unwrap();
    assert_eq!(low.state(), State::Suspend);

    // `main`, still the higher-priority task, keeps the CPU across the
    // scheduling point that drains the resume: a lower-priority task
    // becoming runnable never preempts it.
    let next = sched.yield_task(&mut main);
    assert_eq!(next, main_ptr);
    assert_eq!(low.state(), State::Active);
}

#[test]
#[sequential]
fn stack_overflow_is_detected_via_canary_degradation() {
    let mut sched = scheduler();
    sched.reset();
    sched.port_mut().reset_observations();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut low = Task::new();
    init_task(&mut low, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut low as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    assert!(main.guard_intact());
    for _ in 0..5 {
        let next = sched.yield_task(&mut main);
        assert_eq!(next, main_ptr);
        assert!(sched.port_mut().faulted_task().is_null());
    }

    // One word past the usable stack: a write into the guard band.
    main.set_guard_word(0xDEAD_BEEF);

    // No real MPU on the mock port: the write itself does not fault. The
    // canary mismatch is only caught at `main`'s next scheduling point.
    let _ = sched.yield_task(&mut main);
    assert_eq!(sched.port_mut().faulted_task(), main_ptr);
}

#[test]
#[sequential]
fn ten_thousand_rounds_of_signal_qd_and_wait_never_lose_a_wakeup() {
    let mut sched = scheduler();
    sched.reset();
    sched.port_mut().reset_observations();

    let mut main = Task::new();
    init_task(&mut main, 0, dummy, 0).unwrap();
    let mut consumer = Task::new();
    init_task(&mut consumer, 1, dummy, 0).unwrap();

    let main_ptr = &mut main as *mut Task;
    let mut tasks = [main_ptr, &mut consumer as *mut Task];
    sched.init(&mut tasks, main_ptr).unwrap();

    let sem = Semaphore::new(0);

    for round in 0..10_000u32 {
        sem.wait(&mut sched, &mut consumer);
        assert_eq!(consumer.state(), State::WaitFor, "round {round}: wait did not block");

        // The producer side runs from interrupt context: deferred post,
        // no yield.
        sem.signal_qd(&mut sched).unwrap();
        assert_eq!(
            consumer.state(),
            State::WaitFor,
            "round {round}: deferred signal must not promote synchronously"
        );

        let next = sched.yield_task(&mut main);
        assert_eq!(next, main_ptr);
        assert_eq!(consumer.state(), State::Active, "round {round}: wakeup lost");
        assert_eq!(sem.value(), 0, "round {round}: value drifted");
    }
}
