use object::layout::{association, linked_list, process, scheduler, semaphore};
use object::{Oop, Value, special_index};

use crate::host::monotonic_millis;
use crate::{VM, VmError};

/// Number of priority levels in a ProcessorScheduler.
pub const PRIORITY_LEVELS: usize = 8;

impl VM {
    // ── Scheduler state ────────────────────────────────────────────

    /// The ProcessorScheduler held by the `#Processor` association.
    pub(crate) fn scheduler(&self) -> Result<Oop, VmError> {
        self.memory
            .fetch(self.special.scheduler_association, association::VALUE)?
            .as_oop()
            .ok_or_else(|| VmError::invariant("Processor is not bound to a scheduler"))
    }

    pub(crate) fn active_process(&self) -> Result<Oop, VmError> {
        self.object_field(self.scheduler()?, scheduler::ACTIVE_PROCESS)
            .ok_or_else(|| VmError::invariant("scheduler has no active process"))
    }

    fn priority_of(&self, process: Oop) -> Result<usize, VmError> {
        self.memory
            .fetch(process, process::PRIORITY)?
            .as_small_int()
            .and_then(|p| usize::try_from(p).ok())
            .ok_or_else(|| VmError::scheduler(format!("{process:?} has no priority")))
    }

    /// The run queue for `priority` (1-based).
    fn process_list(&self, priority: usize) -> Result<Oop, VmError> {
        let lists = self
            .object_field(self.scheduler()?, scheduler::PROCESS_LISTS)
            .ok_or_else(|| VmError::scheduler("scheduler has no process lists"))?;
        let count = self.memory.indexable_len(lists)?;
        if priority == 0 || priority > count {
            return Err(VmError::scheduler(format!(
                "priority {priority} outside 1..={count}"
            )));
        }
        self.memory
            .fetch_indexed(lists, priority - 1)?
            .as_oop()
            .ok_or_else(|| VmError::scheduler(format!("no run queue for priority {priority}")))
    }

    /// Named slot `index` when it holds a heap object other than nil.
    fn object_field(&self, oop: Oop, index: usize) -> Option<Oop> {
        self.memory
            .fetch(oop, index)
            .ok()
            .and_then(Value::as_oop)
            .filter(|o| Value::Object(*o) != self.nil())
    }

    // ── Linked lists ───────────────────────────────────────────────

    fn is_empty_list(&self, list: Oop) -> Result<bool, VmError> {
        Ok(self.memory.fetch(list, linked_list::FIRST_LINK)? == self.nil())
    }

    fn add_last_link(&mut self, list: Oop, link: Oop) -> Result<(), VmError> {
        let value = Value::Object(link);
        match self.object_field(list, linked_list::LAST_LINK) {
            Some(last) => self.memory.store(last, process::NEXT_LINK, value)?,
            None => self.memory.store(list, linked_list::FIRST_LINK, value)?,
        }
        self.memory.store(list, linked_list::LAST_LINK, value)?;
        self.memory.store(link, process::MY_LIST, Value::Object(list))?;
        Ok(())
    }

    fn remove_first_link(&mut self, list: Oop) -> Result<Oop, VmError> {
        let nil = self.nil();
        let first = self
            .object_field(list, linked_list::FIRST_LINK)
            .ok_or_else(|| VmError::scheduler(format!("removing from empty list {list:?}")))?;
        let last = self.memory.fetch(list, linked_list::LAST_LINK)?;
        if last == Value::Object(first) {
            self.memory.store(list, linked_list::FIRST_LINK, nil)?;
            self.memory.store(list, linked_list::LAST_LINK, nil)?;
        } else {
            let next = self.memory.fetch(first, process::NEXT_LINK)?;
            if next == nil {
                return Err(VmError::scheduler(format!("{list:?} ends before its last link")));
            }
            self.memory.store(list, linked_list::FIRST_LINK, next)?;
        }
        self.memory.store(first, process::NEXT_LINK, nil)?;
        self.memory.store(first, process::MY_LIST, nil)?;
        Ok(first)
    }

    /// Unlink `link` from anywhere in `list`.
    pub(crate) fn remove_link(&mut self, list: Oop, link: Oop) -> Result<(), VmError> {
        let nil = self.nil();
        let first = self.object_field(list, linked_list::FIRST_LINK);
        if first == Some(link) {
            self.remove_first_link(list)?;
            return Ok(());
        }
        let mut previous = first
            .ok_or_else(|| VmError::scheduler(format!("{link:?} is not in empty list {list:?}")))?;
        loop {
            let next = self.object_field(previous, process::NEXT_LINK).ok_or_else(|| {
                VmError::scheduler(format!("{link:?} claims membership of {list:?}"))
            })?;
            if next == link {
                break;
            }
            previous = next;
        }
        let after = self.memory.fetch(link, process::NEXT_LINK)?;
        self.memory.store(previous, process::NEXT_LINK, after)?;
        if self.memory.fetch(list, linked_list::LAST_LINK)? == Value::Object(link) {
            self.memory
                .store(list, linked_list::LAST_LINK, Value::Object(previous))?;
        }
        self.memory.store(link, process::NEXT_LINK, nil)?;
        self.memory.store(link, process::MY_LIST, nil)?;
        Ok(())
    }

    // ── Process transitions ────────────────────────────────────────

    /// Queue `process` as runnable at its priority.
    fn put_to_sleep(&mut self, process: Oop) -> Result<(), VmError> {
        let list = self.process_list(self.priority_of(process)?)?;
        self.add_last_link(list, process)
    }

    /// Dequeue the first process of the highest non-empty priority.
    fn wake_highest_priority(&mut self) -> Result<Option<Oop>, VmError> {
        let lists = self
            .object_field(self.scheduler()?, scheduler::PROCESS_LISTS)
            .ok_or_else(|| VmError::scheduler("scheduler has no process lists"))?;
        for priority in (1..=self.memory.indexable_len(lists)?).rev() {
            let list = self.process_list(priority)?;
            if !self.is_empty_list(list)? {
                return self.remove_first_link(list).map(Some);
            }
        }
        Ok(None)
    }

    /// Store the running context into the active process.
    fn save_active_context(&mut self) -> Result<(), VmError> {
        let Some(ctx) = self.state.context else {
            return Ok(());
        };
        self.flush_registers()?;
        let active = self.active_process()?;
        self.memory
            .store(active, process::SUSPENDED_CONTEXT, Value::Object(ctx))?;
        Ok(())
    }

    /// Make `process` the active process and continue in its context.
    pub(crate) fn transfer_to(&mut self, process: Oop) -> Result<(), VmError> {
        if !self.state.idle {
            self.save_active_context()?;
        }
        let ctx = self.object_field(process, process::SUSPENDED_CONTEXT).ok_or_else(|| {
            VmError::scheduler(format!("{process:?} has no suspended context"))
        })?;
        let scheduler = self.scheduler()?;
        self.memory
            .store(scheduler, scheduler::ACTIVE_PROCESS, Value::Object(process))?;
        let nil = self.nil();
        self.memory.store(process, process::SUSPENDED_CONTEXT, nil)?;
        self.state.context = None;
        self.load_context(ctx)?;
        self.stats.process_switches += 1;
        log::debug!("switched to {process:?} at {ctx:?}");
        Ok(())
    }

    /// Park the active process; nothing runs until a signal arrives.
    fn go_idle(&mut self) -> Result<(), VmError> {
        self.save_active_context()?;
        self.state.context = None;
        self.state.home = None;
        self.state.method = None;
        self.state.idle = true;
        log::debug!("no runnable process, idling");
        Ok(())
    }

    /// Run `process`, preempting the active one if its priority is higher.
    pub(crate) fn resume(&mut self, process: Oop) -> Result<(), VmError> {
        if self.state.idle {
            return self.put_to_sleep(process);
        }
        let active = self.active_process()?;
        if self.priority_of(process)? > self.priority_of(active)? {
            self.put_to_sleep(active)?;
            self.transfer_to(process)
        } else {
            self.put_to_sleep(process)
        }
    }

    /// Give the processor to the highest-priority runnable process.
    pub(crate) fn switch_to_next(&mut self) -> Result<(), VmError> {
        match self.wake_highest_priority()? {
            Some(process) => self.transfer_to(process),
            None => self.go_idle(),
        }
    }

    /// Let the next runnable process of the active priority run first.
    pub(crate) fn yield_active(&mut self) -> Result<(), VmError> {
        if self.state.idle {
            return Ok(());
        }
        let active = self.active_process()?;
        let list = self.process_list(self.priority_of(active)?)?;
        if self.is_empty_list(list)? {
            return Ok(());
        }
        self.put_to_sleep(active)?;
        let next = self.remove_first_link(list)?;
        self.transfer_to(next)
    }

    /// Suspend `process` while it is not the active one: unlink it from the
    /// list it waits on and answer that list.
    pub(crate) fn suspend_waiting(&mut self, process: Oop) -> Result<Value, VmError> {
        let Some(list) = self.object_field(process, process::MY_LIST) else {
            return Ok(self.nil());
        };
        self.remove_link(list, process)?;
        Ok(Value::Object(list))
    }

    // ── Semaphores ─────────────────────────────────────────────────

    /// A Semaphore with no waiters and no excess signals.
    pub fn new_semaphore(&mut self) -> Result<Oop, VmError> {
        let sem = self.memory.instantiate(self.special.class_semaphore, 0)?;
        self.memory
            .store(sem, semaphore::EXCESS_SIGNALS, Value::from_i64(0))?;
        Ok(sem)
    }

    /// Append `sem` to the ExternalObjects array and answer its 1-based
    /// index for [`crate::HostHandle::signal_semaphore`].
    pub fn register_external_semaphore(&mut self, sem: Oop) -> Result<usize, VmError> {
        let nil = self.nil();
        let mut entries = match self.special.get(&self.memory, special_index::EXTERNAL_OBJECTS) {
            Value::Object(array) if Value::Object(array) != nil => {
                self.memory.object(array)?.storage.values(nil)
            }
            _ => Vec::new(),
        };
        entries.push(Value::Object(sem));
        let index = entries.len();
        let array = self.new_array(entries);
        self.memory.store_indexed(
            self.special.array,
            special_index::EXTERNAL_OBJECTS,
            Value::Object(array),
        )?;
        Ok(index)
    }

    fn excess_signals(&self, sem: Oop) -> Result<i64, VmError> {
        self.memory
            .fetch(sem, semaphore::EXCESS_SIGNALS)?
            .as_small_int()
            .ok_or_else(|| VmError::scheduler(format!("{sem:?} has no excess signal count")))
    }

    pub(crate) fn is_semaphore(&self, value: Value) -> bool {
        value
            .as_oop()
            .and_then(|oop| self.memory.class_of(oop).ok())
            .is_some_and(|class| class == self.special.class_semaphore)
    }

    /// Wake the first waiter of `sem`, or bank the signal.
    pub(crate) fn synchronous_signal(&mut self, sem: Oop) -> Result<(), VmError> {
        let excess = self.excess_signals(sem)?;
        if self.is_empty_list(sem)? {
            self.memory
                .store(sem, semaphore::EXCESS_SIGNALS, Value::from_i64(excess + 1))?;
            return Ok(());
        }
        if excess > 0 {
            return Err(VmError::scheduler(format!(
                "{sem:?} has waiters and {excess} excess signals"
            )));
        }
        let process = self.remove_first_link(sem)?;
        self.resume(process)
    }

    /// Consume a banked signal of `sem`, or block the active process on it.
    pub(crate) fn wait(&mut self, sem: Oop) -> Result<(), VmError> {
        let excess = self.excess_signals(sem)?;
        if excess > 0 {
            self.memory
                .store(sem, semaphore::EXCESS_SIGNALS, Value::from_i64(excess - 1))?;
            return Ok(());
        }
        let active = self.active_process()?;
        self.add_last_link(sem, active)?;
        self.switch_to_next()
    }

    // ── Check points ───────────────────────────────────────────────

    /// Count down one send or backward jump; every `check_interval` of
    /// them, service the host and the timer and give peers a turn.
    pub(crate) fn tick(&mut self) -> Result<(), VmError> {
        if self.check_countdown > 1 {
            self.check_countdown -= 1;
            return Ok(());
        }
        self.check_countdown = self.config.check_interval.max(1);
        self.check_interrupts()?;
        self.yield_active()
    }

    fn check_interrupts(&mut self) -> Result<(), VmError> {
        let (signals, input) = self.host.drain();
        for index in signals {
            self.signal_external(index)?;
        }
        if input {
            if let Some(index) = self.input_semaphore {
                self.signal_external(index)?;
            }
        }
        if let Some(deadline) = self.next_wakeup {
            if monotonic_millis() >= deadline {
                self.next_wakeup = None;
                let timer = self.special.get(&self.memory, special_index::TIMER_SEMAPHORE);
                if let Some(sem) = timer.as_oop().filter(|_| self.is_semaphore(timer)) {
                    self.synchronous_signal(sem)?;
                }
            }
        }
        Ok(())
    }

    /// Signal entry `index` (1-based) of the ExternalObjects array.
    fn signal_external(&mut self, index: usize) -> Result<(), VmError> {
        let externals = self.special.get(&self.memory, special_index::EXTERNAL_OBJECTS);
        let entry = externals
            .as_oop()
            .and_then(|array| index.checked_sub(1).map(|i| (array, i)))
            .and_then(|(array, i)| self.memory.fetch_indexed(array, i).ok());
        match entry {
            Some(value) if self.is_semaphore(value) => match value.as_oop() {
                Some(sem) => self.synchronous_signal(sem),
                None => Ok(()),
            },
            _ => {
                log::warn!("external object {index} is not a semaphore");
                Ok(())
            }
        }
    }

    /// Whether anything outside the image could ever make a process
    /// runnable again.
    fn can_be_woken(&self) -> bool {
        if self.input_semaphore.is_some() || self.next_wakeup.is_some() || self.host.has_pending() {
            return true;
        }
        let nil = self.nil();
        match self.special.get(&self.memory, special_index::EXTERNAL_OBJECTS) {
            Value::Object(array) if Value::Object(array) != nil => self
                .memory
                .get(array)
                .is_some_and(|o| o.storage.values(nil).into_iter().any(|v| self.is_semaphore(v))),
            _ => false,
        }
    }

    /// One round of waiting while no process is runnable.
    pub(crate) fn idle_wait(&mut self) -> Result<(), VmError> {
        if !self.can_be_woken() {
            return Err(VmError::scheduler(
                "every process is blocked and nothing can signal a semaphore",
            ));
        }
        if !self.host.has_pending() {
            self.host.wait_until(self.next_wakeup);
        }
        self.check_interrupts()?;
        if let Some(process) = self.wake_highest_priority()? {
            self.transfer_to(process)?;
        }
        Ok(())
    }
}
