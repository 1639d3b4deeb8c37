//! CPU fair-share scheduling for the jobs of one shard.
//!
//! Scheduling groups are created once, when the process starts, and the handles are attached to
//! job configuration. Every shard then runs its jobs on a [FairShareExecutor], which decides which
//! ready job gets polled next based on how much CPU time each group has consumed relative to its
//! shares. A job issuing calls at a high parallelism can therefore not starve the call loops of
//! another job on the same shard, which would inflate that job's measured latencies.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use futures::task::{waker_ref, ArcWake, AtomicWaker};
use parking_lot::Mutex;

/// Shares given to a group when none are configured.
pub const DEFAULT_SHARES: u32 = 100;

/// Upper bound on the number of groups a process may create, including the default group.
pub const MAX_SCHEDULING_GROUPS: usize = 16;

const TIME_SLICE: Duration = Duration::from_micros(500);

/// An opaque handle to a scheduling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingGroup {
    inner: Arc<GroupInfo>,
}

#[derive(Debug, PartialEq, Eq)]
struct GroupInfo {
    id: usize,
    name: String,
    shares: u32,
}

impl Default for SchedulingGroup {
    /// The group that work runs in until it is assigned to a group of its own.
    fn default() -> Self {
        Self {
            inner: Arc::new(GroupInfo {
                id: 0,
                name: "main".to_string(),
                shares: DEFAULT_SHARES,
            }),
        }
    }
}

impl SchedulingGroup {
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shares(&self) -> u32 {
        self.inner.shares
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub enum SchedulingGroupError {
    #[display("Scheduling group [{name}] must have a positive number of shares")]
    ZeroShares { name: String },
    #[display("Cannot create scheduling group [{name}], at most {limit} groups are supported")]
    TooManyGroups { name: String, limit: usize },
}

/// The set of scheduling groups for a process.
#[derive(Debug)]
pub struct SchedulingGroups {
    groups: Vec<SchedulingGroup>,
}

impl Default for SchedulingGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingGroups {
    pub fn new() -> Self {
        Self {
            groups: vec![SchedulingGroup::default()],
        }
    }

    pub fn create(
        &mut self,
        name: &str,
        shares: u32,
    ) -> Result<SchedulingGroup, SchedulingGroupError> {
        if shares == 0 {
            return Err(SchedulingGroupError::ZeroShares {
                name: name.to_string(),
            });
        }
        if self.groups.len() >= MAX_SCHEDULING_GROUPS {
            return Err(SchedulingGroupError::TooManyGroups {
                name: name.to_string(),
                limit: MAX_SCHEDULING_GROUPS,
            });
        }

        let group = SchedulingGroup {
            inner: Arc::new(GroupInfo {
                id: self.groups.len(),
                name: name.to_string(),
                shares,
            }),
        };
        log::debug!("Created scheduling group [{}] with {} shares", name, shares);
        self.groups.push(group.clone());

        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

thread_local! {
    static CURRENT_GROUP: RefCell<SchedulingGroup> = RefCell::new(SchedulingGroup::default());
}

/// The group of the task a [FairShareExecutor] is polling on this thread. Outside of one, the
/// default group.
pub fn current_scheduling_group() -> SchedulingGroup {
    CURRENT_GROUP.with(|current| current.borrow().clone())
}

pub type Task<'a> = LocalBoxFuture<'a, anyhow::Result<()>>;

#[derive(Default)]
struct ReadyQueue {
    woken: Mutex<VecDeque<usize>>,
    waker: AtomicWaker,
}

struct TaskWaker {
    task: usize,
    queued: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.ready.woken.lock().push_back(arc_self.task);
            arc_self.ready.waker.wake();
        }
    }
}

struct TaskSlot<'a> {
    group: usize,
    waker: Arc<TaskWaker>,
    future: Task<'a>,
}

struct GroupRunQueue {
    group: SchedulingGroup,
    vruntime: u64,
    ready: VecDeque<usize>,
}

/// Runs a set of tasks to completion on the current thread, sharing CPU time between their
/// scheduling groups in proportion to the groups' shares.
///
/// Each group accumulates virtual runtime: the wall time spent polling its tasks, scaled by
/// `DEFAULT_SHARES / shares`. The ready group with the least virtual runtime is polled next. A
/// group that becomes ready after idling starts from the current minimum, so it cannot bank
/// credit while waiting on the network. After every time slice control goes back to the
/// surrounding runtime so that I/O readiness is processed.
///
/// The first task to fail aborts the run, dropping all other tasks.
pub struct FairShareExecutor<'a> {
    groups: Vec<GroupRunQueue>,
    tasks: Vec<Option<TaskSlot<'a>>>,
    live: usize,
    ready: Arc<ReadyQueue>,
    min_vruntime: u64,
}

impl Default for FairShareExecutor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FairShareExecutor<'a> {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            tasks: Vec::new(),
            live: 0,
            ready: Arc::new(ReadyQueue::default()),
            min_vruntime: 0,
        }
    }

    /// Add a task to run in the given group. Nothing is polled until [FairShareExecutor::run].
    pub fn spawn(
        &mut self,
        group: &SchedulingGroup,
        future: impl Future<Output = anyhow::Result<()>> + 'a,
    ) {
        let group_index = self.group_index(group);
        let task = self.tasks.len();
        self.tasks.push(Some(TaskSlot {
            group: group_index,
            waker: Arc::new(TaskWaker {
                task,
                queued: AtomicBool::new(true),
                ready: self.ready.clone(),
            }),
            future: Box::pin(future),
        }));
        self.live += 1;
        self.enqueue(group_index, task);
    }

    /// Poll all tasks until they have completed, or until one of them fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        futures::future::poll_fn(|cx| self.poll_tasks(cx)).await
    }

    fn group_index(&mut self, group: &SchedulingGroup) -> usize {
        match self
            .groups
            .iter()
            .position(|run_queue| run_queue.group.id() == group.id())
        {
            Some(index) => index,
            None => {
                self.groups.push(GroupRunQueue {
                    group: group.clone(),
                    vruntime: self.min_vruntime,
                    ready: VecDeque::new(),
                });
                self.groups.len() - 1
            }
        }
    }

    fn enqueue(&mut self, group_index: usize, task: usize) {
        let run_queue = &mut self.groups[group_index];
        if run_queue.ready.is_empty() {
            run_queue.vruntime = run_queue.vruntime.max(self.min_vruntime);
        }
        run_queue.ready.push_back(task);
    }

    fn collect_woken(&mut self) {
        let woken = std::mem::take(&mut *self.ready.woken.lock());
        for task in woken {
            if let Some(group_index) = self.tasks[task].as_ref().map(|slot| slot.group) {
                self.enqueue(group_index, task);
            }
        }
    }

    fn pick_group(&mut self) -> Option<usize> {
        let picked = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, run_queue)| !run_queue.ready.is_empty())
            .min_by_key(|(_, run_queue)| run_queue.vruntime)
            .map(|(index, _)| index)?;
        self.min_vruntime = self.min_vruntime.max(self.groups[picked].vruntime);

        Some(picked)
    }

    fn charge(&mut self, group_index: usize, spent: Duration) {
        let run_queue = &mut self.groups[group_index];
        let scaled = spent.as_nanos().saturating_mul(u128::from(DEFAULT_SHARES))
            / u128::from(run_queue.group.shares());
        run_queue.vruntime = run_queue
            .vruntime
            .saturating_add(u64::try_from(scaled).unwrap_or(u64::MAX));
    }

    fn poll_tasks(&mut self, cx: &mut Context<'_>) -> Poll<anyhow::Result<()>> {
        self.ready.waker.register(cx.waker());
        let slice_started = Instant::now();

        loop {
            self.collect_woken();
            if self.live == 0 {
                return Poll::Ready(Ok(()));
            }

            let Some(group_index) = self.pick_group() else {
                return Poll::Pending;
            };
            let Some(task) = self.groups[group_index].ready.pop_front() else {
                continue;
            };

            let group = self.groups[group_index].group.clone();
            let (poll, spent) = match self.tasks[task].as_mut() {
                Some(slot) => {
                    slot.waker.queued.store(false, Ordering::Release);
                    let waker = waker_ref(&slot.waker);
                    let mut task_cx = Context::from_waker(&waker);
                    let previous = CURRENT_GROUP.with(|current| current.replace(group));
                    let started = Instant::now();
                    let poll = slot.future.as_mut().poll(&mut task_cx);
                    let spent = started.elapsed();
                    CURRENT_GROUP.with(|current| current.replace(previous));
                    (poll, spent)
                }
                None => continue,
            };
            self.charge(group_index, spent);

            match poll {
                Poll::Ready(Ok(())) => {
                    self.tasks[task] = None;
                    self.live -= 1;
                }
                Poll::Ready(Err(e)) => {
                    log::debug!(
                        "Task in scheduling group [{}] failed, aborting the remaining tasks",
                        self.groups[group_index].group.name()
                    );
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => {}
            }

            if slice_started.elapsed() >= TIME_SLICE {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::pin::Pin;
    use std::rc::Rc;

    struct YieldNow(bool);

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    fn spin_for(duration: Duration) {
        let until = Instant::now() + duration;
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn create_groups() {
        let mut groups = SchedulingGroups::new();
        let a = groups.create("a", 200).unwrap();
        let b = groups.create("b", 50).unwrap();

        assert_eq!(3, groups.len());
        assert_eq!("a", a.name());
        assert_eq!(200, a.shares());
        assert_ne!(a.id(), b.id());
        assert_ne!(SchedulingGroup::default().id(), a.id());
    }

    #[test]
    fn reject_zero_shares() {
        let mut groups = SchedulingGroups::new();
        let err = groups.create("none", 0).unwrap_err();
        assert!(matches!(err, SchedulingGroupError::ZeroShares { .. }));
    }

    #[test]
    fn reject_too_many_groups() {
        let mut groups = SchedulingGroups::new();
        for i in 1..MAX_SCHEDULING_GROUPS {
            groups.create(&format!("group-{i}"), 100).unwrap();
        }
        let err = groups.create("one-too-many", 100).unwrap_err();
        assert!(matches!(err, SchedulingGroupError::TooManyGroups { .. }));
    }

    #[tokio::test]
    async fn run_all_tasks_to_completion() {
        let mut groups = SchedulingGroups::new();
        let a = groups.create("a", 100).unwrap();
        let b = groups.create("b", 300).unwrap();
        let finished = Rc::new(Cell::new(0));

        let mut executor = FairShareExecutor::new();
        for (i, group) in [&a, &b, &a].into_iter().enumerate() {
            let finished = finished.clone();
            executor.spawn(group, async move {
                tokio::time::sleep(Duration::from_millis(10 * (i as u64 + 1))).await;
                finished.set(finished.get() + 1);
                Ok(())
            });
        }
        executor.run().await.unwrap();

        assert_eq!(3, finished.get());
    }

    #[tokio::test]
    async fn tasks_run_in_their_group() {
        let mut groups = SchedulingGroups::new();
        let a = groups.create("a", 100).unwrap();
        let b = groups.create("b", 300).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let mut executor = FairShareExecutor::new();
        for group in [&a, &b] {
            let seen = seen.clone();
            executor.spawn(group, async move {
                seen.borrow_mut().push(current_scheduling_group().name().to_string());
                YieldNow(false).await;
                seen.borrow_mut().push(current_scheduling_group().name().to_string());
                Ok(())
            });
        }
        executor.run().await.unwrap();

        let mut seen = seen.take();
        seen.sort();
        assert_eq!(vec!["a", "a", "b", "b"], seen);
        assert_eq!("main", current_scheduling_group().name());
    }

    #[tokio::test]
    async fn empty_executor_completes() {
        FairShareExecutor::new().run().await.unwrap();
    }

    #[tokio::test]
    async fn first_failure_aborts_the_run() {
        let group = SchedulingGroup::default();
        let mut executor = FairShareExecutor::new();
        executor.spawn(&group, async {
            std::future::pending::<()>().await;
            Ok(())
        });
        executor.spawn(&group, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow::anyhow!("call failed"))
        });

        let err = executor.run().await.unwrap_err();
        assert_eq!("call failed", err.to_string());
    }

    #[tokio::test]
    async fn cpu_time_follows_shares() {
        let mut groups = SchedulingGroups::new();
        let heavy = groups.create("heavy", 400).unwrap();
        let light = groups.create("light", 100).unwrap();

        let total = Rc::new(Cell::new(0u32));
        let heavy_count = Rc::new(Cell::new(0u32));
        let light_count = Rc::new(Cell::new(0u32));

        let mut executor = FairShareExecutor::new();
        for (group, count) in [(&heavy, heavy_count.clone()), (&light, light_count.clone())] {
            let total = total.clone();
            executor.spawn(group, async move {
                while total.get() < 400 {
                    spin_for(Duration::from_micros(100));
                    count.set(count.get() + 1);
                    total.set(total.get() + 1);
                    YieldNow(false).await;
                }
                Ok(())
            });
        }
        executor.run().await.unwrap();

        assert!(
            heavy_count.get() > 2 * light_count.get(),
            "heavy: {}, light: {}",
            heavy_count.get(),
            light_count.get()
        );
        assert!(light_count.get() > 0);
    }
}
