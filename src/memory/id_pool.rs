/// Recycles integer slot ids.
///
/// Returned ids are handed out before new ids, so the id space stays dense
/// under steady-state take/return traffic.
#[derive(Debug)]
pub struct IdPool {
    available: Vec<i32>,
    next_new_id: i32,
}

impl IdPool {
    pub fn new(expected_capacity: i32) -> Self {
        Self {
            available: Vec::with_capacity(expected_capacity.max(0) as usize),
            next_new_id: 0,
        }
    }

    /// Takes an id, reusing a returned one when available.
    pub fn take(&mut self) -> i32 {
        if let Some(id) = self.available.pop() {
            id
        } else {
            let id = self.next_new_id;
            self.next_new_id += 1;
            id
        }
    }

    /// Returns an id for later reuse.
    pub fn return_id(&mut self, id: i32) {
        debug_assert!(
            id >= 0 && id < self.next_new_id,
            "Returned id must have been taken from this pool."
        );
        self.available.push(id);
    }

    /// Number of ids handed out and never returned.
    pub fn outstanding_count(&self) -> i32 {
        self.next_new_id - self.available.len() as i32
    }

    pub fn clear(&mut self) {
        self.available.clear();
        self.next_new_id = 0;
    }
}
