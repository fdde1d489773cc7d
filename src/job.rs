use std::mem;

/// A `Job` is used to advertise work for other threads that they may
/// want to steal. Jobs sit in work-stealing deques (for the thread pool)
/// or in an arena's queue, and are executed by whichever thread pops them.
pub(crate) trait Job {
    /// Unsafe: this may be called from a different thread than the one
    /// which scheduled the job, so the implementer must ensure the
    /// appropriate traits are met, whether `Send`, `Sync`, or both.
    unsafe fn execute(this: *const Self);
}

/// Effectively a Job trait object. Each JobRef **must** be executed
/// exactly once, or else data may leak.
///
/// Internally, we store the job's data in a `*const ()` pointer.  The
/// true type is something like `*const HeapJob<...>`, but we hide
/// it. We also carry the "execute fn" from the `Job` trait.
///
/// The interesting parts of this type are taken from Rayon.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct JobRef {
    pointer: *const (),
    execute_fn: unsafe fn(*const ()),
}

unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

impl JobRef {
    /// Unsafe: caller asserts that `data` will remain valid until the
    /// job is executed.
    pub unsafe fn new<T>(data: *const T) -> JobRef
    where
        T: Job,
    {
        let fn_ptr: unsafe fn(*const T) = <T as Job>::execute;
        // erase types:
        JobRef {
            pointer: data as *const (),
            execute_fn: mem::transmute::<unsafe fn(*const T), unsafe fn(*const ())>(fn_ptr),
        }
    }

    #[inline]
    pub unsafe fn execute(self) {
        (self.execute_fn)(self.pointer)
    }
}

/// A job stored in the heap. When executed, `HeapJob` simply invokes
/// its closure and frees itself. Whatever signaling is needed to report
/// completion is the closure's business.
pub(crate) struct HeapJob<BODY>
where
    BODY: FnOnce() + Send,
{
    job: BODY,
}

impl<BODY> HeapJob<BODY>
where
    BODY: FnOnce() + Send,
{
    pub fn new(job: BODY) -> Box<Self> {
        Box::new(HeapJob { job })
    }

    /// Creates a `JobRef` from this job -- note that this hides all
    /// lifetimes, so it is up to you to ensure that this JobRef
    /// doesn't outlive any data that it closes over.
    pub unsafe fn into_job_ref(self: Box<Self>) -> JobRef {
        JobRef::new(Box::into_raw(self))
    }
}

impl<BODY> Job for HeapJob<BODY>
where
    BODY: FnOnce() + Send,
{
    unsafe fn execute(this: *const Self) {
        let HeapJob { job } = *Box::from_raw(this as *mut Self);
        job();
    }
}

#[test]
fn heap_job_runs_once() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let job = unsafe { HeapJob::new(move || { c.fetch_add(1, Ordering::SeqCst); }).into_job_ref() };

    unsafe { job.execute(); }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    // The closure (and its clone of the counter) was dropped with the job.
    assert_eq!(Arc::strong_count(&counter), 1);
}
