use std::collections::VecDeque;

/// Online win-probability estimate for one price interval `[lhs, rhs)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub lhs: f64,
    pub rhs: f64,
    pub alpha: f64,
    pub beta: f64,
    /// Newest outcome first.
    pub buffer: VecDeque<bool>,
    pub capacity: usize,
    pub discount: f64,
    pub pr: f64,
    pub update_qty: u64,
}

impl Bucket {
    pub fn new(lhs: f64, rhs: f64, capacity: usize, discount: f64) -> Self {
        Self {
            lhs,
            rhs,
            alpha: 1.0,
            beta: 1.0,
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            discount,
            pr: 0.5,
            update_qty: 0,
        }
    }

    pub fn midpoint(&self) -> f64 {
        self.lhs + (self.rhs - self.lhs) / 2.0
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lhs && price < self.rhs
    }

    /// Pushes one outcome; once the window is full the oldest outcome's
    /// pseudo-count is withdrawn first.
    pub fn update(&mut self, impression: bool) {
        self.update_qty += 1;
        if self.buffer.len() >= self.capacity {
            if let Some(evicted) = self.buffer.pop_back() {
                if evicted {
                    self.alpha -= 1.0;
                } else {
                    self.beta -= 1.0;
                }
            }
        }
        self.buffer.push_front(impression);
        if impression {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }

        let window_rate = self.alpha / (self.alpha + self.beta);
        self.pr = (self.discount * self.pr + (1.0 - self.discount) * window_rate).clamp(0.0, 1.0);
    }
}
