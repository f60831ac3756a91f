use crate::handle::Handle;
use crate::message::Session;
use slog::{warn, Logger};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

const NEAR_SHIFT: u32 = 8;
const NEAR: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = NEAR as u32 - 1;
const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = LEVEL as u32 - 1;
const LEVEL_COUNT: usize = 4;

/// One logical tick is a centisecond of wall time.
pub const TICK_MILLIS: u64 = 10;
/// The timer thread polls at a quarter tick so logical time never lags by
/// more than a fraction of a tick under normal load.
pub const UPDATE_INTERVAL_MICROS: u64 = 2500;

/// Expiry notification target: the service/session pair that asked for it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimerEvent {
    pub handle: Handle,
    pub session: Session,
}

struct TimerNode {
    expire: u32,
    event: TimerEvent,
}

/// The hierarchical wheel proper: one near wheel of 256 slots and four
/// coarser wheels of 64. Purely mechanical; the owning [`Timer`] drives it
/// and delivers what expires.
struct Wheel {
    near: Vec<Vec<TimerNode>>,
    levels: Vec<Vec<Vec<TimerNode>>>,
    time: u32,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            near: (0..NEAR).map(|_| Vec::new()).collect(),
            levels: (0..LEVEL_COUNT)
                .map(|_| (0..LEVEL).map(|_| Vec::new()).collect())
                .collect(),
            time: 0,
        }
    }

    fn add(&mut self, node: TimerNode) {
        let time = node.expire;
        let current = self.time;
        if (time | NEAR_MASK) == (current | NEAR_MASK) {
            self.near[(time & NEAR_MASK) as usize].push(node);
        } else {
            let mut mask = (NEAR as u32) << LEVEL_SHIFT;
            let mut level = 0;
            while level < LEVEL_COUNT - 1 {
                if (time | (mask - 1)) == (current | (mask - 1)) {
                    break;
                }
                mask <<= LEVEL_SHIFT;
                level += 1;
            }
            let shift = NEAR_SHIFT + level as u32 * LEVEL_SHIFT;
            let slot = (time >> shift) & LEVEL_MASK;
            self.levels[level][slot as usize].push(node);
        }
    }

    /// Re-add every node of a coarser slot so it lands one level finer.
    fn cascade(&mut self, level: usize, slot: usize) {
        let nodes = std::mem::take(&mut self.levels[level][slot]);
        for node in nodes {
            self.add(node);
        }
    }

    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.cascade(3, 0);
            return;
        }
        let mut mask = NEAR as u32;
        let mut time = ct >> NEAR_SHIFT;
        let mut level = 0;
        while ct & (mask - 1) == 0 {
            let slot = (time & LEVEL_MASK) as usize;
            if slot != 0 {
                self.cascade(level, slot);
                break;
            }
            mask <<= LEVEL_SHIFT;
            time >>= LEVEL_SHIFT;
            level += 1;
        }
    }

    fn execute(&mut self, fired: &mut Vec<TimerEvent>) {
        let slot = (self.time & NEAR_MASK) as usize;
        while !self.near[slot].is_empty() {
            let nodes = std::mem::take(&mut self.near[slot]);
            fired.extend(nodes.into_iter().map(|n| n.event));
        }
    }

    /// Advance one tick, collecting everything that expired. Fires before
    /// and after the shift so zero-delta stragglers are not missed.
    fn tick(&mut self, fired: &mut Vec<TimerEvent>) {
        self.execute(fired);
        self.shift();
        self.execute(fired);
    }
}

/// Wall-clock anchored timer front end. Logical time advances by measured
/// monotonic-clock delta, so stalls are caught up tick by tick and a clock
/// that steps backwards is absorbed rather than rewound.
pub struct Timer {
    wheel: Mutex<Wheel>,
    starttime: u32,
    current: Mutex<u64>,
    current_point: Mutex<u64>,
    origin: Instant,
    log: Logger,
}

impl Timer {
    pub fn new(log: Logger) -> Timer {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock predates the epoch");
        Timer {
            wheel: Mutex::new(Wheel::new()),
            starttime: now.as_secs() as u32,
            current: Mutex::new(u64::from(now.subsec_millis() / TICK_MILLIS as u32)),
            current_point: Mutex::new(0),
            origin: Instant::now(),
            log,
        }
    }

    /// UTC seconds at boot.
    #[inline]
    pub fn starttime(&self) -> u32 {
        self.starttime
    }

    /// Ticks since boot.
    #[inline]
    pub fn now(&self) -> u64 {
        *self.current.lock().unwrap()
    }

    /// Register an expiry `ticks` from now. `ticks <= 0` is handled by the
    /// caller as an immediate delivery; this only files future nodes.
    pub fn add(&self, ticks: u32, event: TimerEvent) {
        let mut wheel = self.wheel.lock().unwrap();
        let expire = wheel.time.wrapping_add(ticks);
        wheel.add(TimerNode { expire, event });
    }

    /// Monotonic centiseconds since construction.
    #[inline]
    fn gettime(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * 100 + u64::from(elapsed.subsec_millis()) / TICK_MILLIS
    }

    /// Advance logical time to match the monotonic clock, returning every
    /// event that expired. Called by the timer thread every 2.5 ms.
    pub fn update(&self) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        let cp = self.gettime();
        let mut point = self.current_point.lock().unwrap();
        if cp < *point {
            warn!(self.log, "time diff error"; "from" => *point, "to" => cp);
            *point = cp;
        } else if cp != *point {
            let diff = cp - *point;
            *point = cp;
            *self.current.lock().unwrap() += diff;
            let mut wheel = self.wheel.lock().unwrap();
            for _ in 0..diff {
                wheel.tick(&mut fired);
            }
        }
        fired
    }

    #[cfg(test)]
    fn advance(&self, ticks: u32) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        let mut wheel = self.wheel.lock().unwrap();
        for _ in 0..ticks {
            wheel.tick(&mut fired);
        }
        fired
    }
}
