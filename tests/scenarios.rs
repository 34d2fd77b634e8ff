// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios S1-S4 from the design notes: ordered ticks, schedule
//! fairness, a module removing itself mid-tick, and a stop request that
//! lands mid-tick; plus a module using its own `ModuleHandle::schedule`
//! convenience and having a failing job routed to its `on_exception`.

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use taskloop::prelude::*;
use taskloop::ScheduledTask;

fn log() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

struct Recording {
    name: &'static str,
    exec_type: ExecutionType,
    log: Arc<Mutex<Vec<&'static str>>>,
    sleep: Duration,
}

impl Module for Recording {
    fn on_update(&self) -> Result<()> {
        if !self.sleep.is_zero() {
            thread::sleep(self.sleep);
        }
        self.log.lock().unwrap().push(self.name);
        Ok(())
    }

    fn execution_type(&self) -> ExecutionType {
        self.exec_type
    }
}

/// S1. Ordered ticks: A(-1) runs before {B, C}(0) run (in either order)
/// before D(1). D stops the loop once it has run, so exactly one tick is
/// observed.
#[test]
fn s1_ordered_ticks() {
    let events = log();
    let app = Loop::new();

    app.modules()
        .add(
            Arc::new(Recording {
                name: "A",
                exec_type: ExecutionType::BoundedAsync,
                log: Arc::clone(&events),
                sleep: Duration::ZERO,
            }),
            Priority::new(-1),
        )
        .unwrap();
    app.modules()
        .add(
            Arc::new(Recording {
                name: "B",
                exec_type: ExecutionType::BoundedAsync,
                log: Arc::clone(&events),
                sleep: Duration::ZERO,
            }),
            Priority::ZERO,
        )
        .unwrap();
    app.modules()
        .add(
            Arc::new(Recording {
                name: "C",
                exec_type: ExecutionType::BoundedAsync,
                log: Arc::clone(&events),
                sleep: Duration::ZERO,
            }),
            Priority::ZERO,
        )
        .unwrap();

    struct StoppingD {
        log: Arc<Mutex<Vec<&'static str>>>,
        app: Mutex<Option<Loop>>,
    }
    impl Module for StoppingD {
        fn on_update(&self) -> Result<()> {
            self.log.lock().unwrap().push("D");
            if let Some(app) = self.app.lock().unwrap().as_ref() {
                app.stop();
            }
            Ok(())
        }
        fn execution_type(&self) -> ExecutionType {
            ExecutionType::SingleThreaded
        }
    }

    let d = Arc::new(StoppingD {
        log: Arc::clone(&events),
        app: Mutex::new(Some(app.clone())),
    });
    app.modules().add(d, Priority::new(1)).unwrap();

    app.run().unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], "A");
    let mid: std::collections::HashSet<_> = [events[1], events[2]].into_iter().collect();
    assert_eq!(
        mid,
        ["B", "C"].into_iter().collect::<std::collections::HashSet<_>>()
    );
    assert_eq!(events[3], "D");
}

/// S2. Schedules fire in fire-time order (ties broken by push order), and
/// always before the priority-0 module's `on_update` in the tick where they
/// become due.
#[test]
fn s2_schedule_fires_in_order() {
    let events = log();
    let app = Loop::new();

    let log_for = |name: &'static str| {
        let events = Arc::clone(&events);
        Box::new(move || {
            events.lock().unwrap().push(name);
            Ok(())
        }) as ScheduledTask
    };

    // Pushed before `run()`; fire times are measured from the loop's own
    // clock, which starts at zero, so these become due almost immediately.
    app.schedule(0.05, ExecutionType::SingleThreaded, log_for("f1"), None)
        .unwrap();
    app.schedule(0.05, ExecutionType::SingleThreaded, log_for("f2"), None)
        .unwrap();
    app.schedule(0.01, ExecutionType::SingleThreaded, log_for("f3"), None)
        .unwrap();

    struct WaitForSchedules {
        log: Arc<Mutex<Vec<&'static str>>>,
        app: Mutex<Option<Loop>>,
    }
    impl Module for WaitForSchedules {
        fn on_update(&self) -> Result<()> {
            let seen: Vec<_> = self.log.lock().unwrap().clone();
            let fired_all =
                seen.contains(&"f1") && seen.contains(&"f2") && seen.contains(&"f3");
            if fired_all {
                self.log.lock().unwrap().push("module");
                if let Some(app) = self.app.lock().unwrap().as_ref() {
                    app.stop();
                }
            }
            Ok(())
        }
    }

    app.modules()
        .add(
            Arc::new(WaitForSchedules {
                log: Arc::clone(&events),
                app: Mutex::new(Some(app.clone())),
            }),
            Priority::ZERO,
        )
        .unwrap();

    app.run().unwrap();

    let events = events.lock().unwrap().clone();
    let pos = |name: &str| events.iter().position(|e| *e == name).unwrap();
    assert!(pos("f3") < pos("f1"));
    assert!(pos("f1") < pos("f2"));
    assert!(pos("f2") < pos("module"));
}

/// S3. A module removing itself from inside `on_update`: its `on_disable`
/// and `on_stop` run on the calling thread before `remove` returns, and the
/// tick (and the loop, since this is the only module) winds down cleanly.
#[test]
fn s3_module_removes_itself() {
    struct SelfRemoving {
        log: Arc<Mutex<Vec<&'static str>>>,
        ctx: Mutex<Option<(Loop, Weak<ModuleHandle>)>>,
    }
    impl SelfRemoving {
        fn set_ctx(&self, app: Loop, handle: Weak<ModuleHandle>) {
            *self.ctx.lock().unwrap() = Some((app, handle));
        }
    }
    impl Module for SelfRemoving {
        fn on_start(&self) -> Result<()> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }
        fn on_disable(&self) -> Result<()> {
            self.log.lock().unwrap().push("disable");
            Ok(())
        }
        fn on_stop(&self) -> Result<()> {
            self.log.lock().unwrap().push("stop");
            Ok(())
        }
        fn on_update(&self) -> Result<()> {
            self.log.lock().unwrap().push("update");
            let ctx = self.ctx.lock().unwrap().clone();
            if let Some((app, weak_handle)) = ctx {
                if let Some(handle) = weak_handle.upgrade() {
                    app.modules().remove(&handle)?;
                }
            }
            Ok(())
        }
    }

    let events = log();
    let app = Loop::new();
    let module = Arc::new(SelfRemoving {
        log: Arc::clone(&events),
        ctx: Mutex::new(None),
    });
    let handle = app
        .modules()
        .add(Arc::clone(&module) as Arc<dyn Module>, Priority::ZERO)
        .unwrap();
    module.set_ctx(app.clone(), Arc::downgrade(&handle));

    // The module removes itself on the very first tick, which empties the
    // module set, so `run()` winds down on its own.
    app.run().unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["start", "update", "disable", "stop"]
    );
    assert!(!app.is_running());
}

/// S4. `Stop` requested from another thread mid-band: the in-progress band
/// completes, but no later band in that tick runs.
#[test]
fn s4_stop_mid_tick_skips_later_bands() {
    let events = log();
    let app = Loop::new();

    app.modules()
        .add(
            Arc::new(Recording {
                name: "early",
                exec_type: ExecutionType::BoundedAsync,
                log: Arc::clone(&events),
                sleep: Duration::from_millis(150),
            }),
            Priority::new(-1),
        )
        .unwrap();
    app.modules()
        .add(
            Arc::new(Recording {
                name: "late",
                exec_type: ExecutionType::BoundedAsync,
                log: Arc::clone(&events),
                sleep: Duration::ZERO,
            }),
            Priority::new(1),
        )
        .unwrap();

    let runner = {
        let app = app.clone();
        thread::spawn(move || app.run())
    };

    thread::sleep(Duration::from_millis(30));
    app.stop();
    runner.join().unwrap().unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["early"]);
}

/// A module that schedules its own follow-up job via
/// `ModuleHandle::schedule` on `on_start`; the job fails, and the failure is
/// routed to this module's own `on_exception` rather than swallowed.
#[test]
fn module_schedule_convenience_wires_own_on_exception() {
    struct SelfScheduling {
        log: Arc<Mutex<Vec<String>>>,
        handle: Mutex<Option<Weak<ModuleHandle>>>,
        app: Mutex<Option<Loop>>,
    }
    impl SelfScheduling {
        fn set_handle(&self, handle: Weak<ModuleHandle>) {
            *self.handle.lock().unwrap() = Some(handle);
        }
    }
    impl Module for SelfScheduling {
        fn on_start(&self) -> Result<()> {
            let handle = self.handle.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let Some(handle) = handle {
                let log = Arc::clone(&self.log);
                handle.schedule(
                    0.0,
                    ExecutionType::BoundedAsync,
                    Box::new(move || {
                        log.lock().unwrap().push("task-ran".to_string());
                        Err(Error::Task("boom".into()))
                    }),
                )?;
            }
            Ok(())
        }

        fn on_update(&self) -> Result<()> {
            let exception_seen = self
                .log
                .lock()
                .unwrap()
                .iter()
                .any(|entry| entry.starts_with("exception:"));
            if exception_seen {
                if let Some(app) = self.app.lock().unwrap().as_ref() {
                    app.stop();
                }
            }
            Ok(())
        }

        fn on_exception(&self, error: &Error) {
            self.log.lock().unwrap().push(format!("exception:{error}"));
        }
    }

    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let app = Loop::new();
    let module = Arc::new(SelfScheduling {
        log: Arc::clone(&events),
        handle: Mutex::new(None),
        app: Mutex::new(Some(app.clone())),
    });
    let handle = app
        .modules()
        .add(Arc::clone(&module) as Arc<dyn Module>, Priority::ZERO)
        .unwrap();
    module.set_handle(Arc::downgrade(&handle));

    app.run().unwrap();

    let events = events.lock().unwrap().clone();
    let task_ran = events.iter().position(|e| e == "task-ran").unwrap();
    let exception = events
        .iter()
        .position(|e| e.starts_with("exception:"))
        .unwrap();
    assert!(task_ran < exception);
    assert!(events[exception].contains("boom"));
}

/// Testable property 2: attaching a module to a second loop fails, and does
/// not disturb its existing attachment.
#[test]
fn module_cannot_attach_to_two_loops_at_once() {
    struct Quiet;
    impl Module for Quiet {
        fn on_update(&self) -> Result<()> {
            Ok(())
        }
    }

    let module: Arc<dyn Module> = Arc::new(Quiet);
    let first = Loop::new();
    let second = Loop::new();

    let handle = first.modules().add(Arc::clone(&module), Priority::ZERO).unwrap();
    assert!(second.modules().add(Arc::clone(&module), Priority::ZERO).is_err());
    assert_eq!(second.modules().len(), 0);

    first.modules().remove(&handle).unwrap();
    // Once detached from the first loop, the same module can attach
    // elsewhere.
    assert!(second.modules().add(Arc::clone(&module), Priority::ZERO).is_ok());
}
