//! Function tables: `funcref` slots addressed by `call_indirect`.

use super::{RuntimeError, Trap, TrapKind};
use crate::parser::module::Limits;

/// A table instance. Each slot is either null or a function index in the
/// owning instance's function index space.
#[derive(Debug)]
pub struct Table {
    elements: Vec<Option<u32>>,
    max: Option<u32>,
}

impl Table {
    /// Allocates a table with every slot null.
    pub fn new(limits: Limits) -> Result<Table, RuntimeError> {
        if let Some(max) = limits.max {
            if limits.min > max {
                return Err(RuntimeError::Memory(format!(
                    "table initial size {} exceeds declared maximum {max}",
                    limits.min
                )));
            }
        }
        Ok(Table {
            elements: vec![None; limits.min as usize],
            max: limits.max,
        })
    }

    /// Current element count.
    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Reads a slot; out of bounds is an `undefined element` trap.
    pub fn get(&self, index: u32) -> Result<Option<u32>, Trap> {
        self.elements
            .get(index as usize)
            .copied()
            .ok_or_else(|| Trap::new(TrapKind::UndefinedElement, format!("table index {index}")))
    }

    /// Writes a slot.
    pub fn set(&mut self, index: u32, value: Option<u32>) -> Result<(), Trap> {
        match self.elements.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Trap::new(TrapKind::UndefinedElement, format!("table index {index}"))),
        }
    }

    /// Copies an element segment into the table at `offset`.
    pub fn init(&mut self, offset: u32, func_indices: &[u32]) -> Result<(), Trap> {
        let end = offset as u64 + func_indices.len() as u64;
        if end > self.elements.len() as u64 {
            return Err(Trap::new(
                TrapKind::UndefinedElement,
                format!("element segment [{offset}, {end}) exceeds table size {}", self.size()),
            ));
        }
        for (i, &func_idx) in func_indices.iter().enumerate() {
            self.elements[offset as usize + i] = Some(func_idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_null() {
        let table = Table::new(Limits::new(4, Some(8))).unwrap();
        assert_eq!(table.size(), 4);
        assert_eq!(table.max(), Some(8));
        for i in 0..4 {
            assert_eq!(table.get(i).unwrap(), None);
        }
    }

    #[test]
    fn get_out_of_bounds_is_undefined_element() {
        let table = Table::new(Limits::new(2, None)).unwrap();
        let trap = table.get(2).unwrap_err();
        assert_eq!(trap.kind, TrapKind::UndefinedElement);
    }

    #[test]
    fn set_and_get() {
        let mut table = Table::new(Limits::new(2, None)).unwrap();
        table.set(1, Some(7)).unwrap();
        assert_eq!(table.get(1).unwrap(), Some(7));
        assert!(table.set(5, Some(0)).is_err());
    }

    #[test]
    fn init_bounds() {
        let mut table = Table::new(Limits::new(3, None)).unwrap();
        table.init(1, &[4, 5]).unwrap();
        assert_eq!(table.get(0).unwrap(), None);
        assert_eq!(table.get(1).unwrap(), Some(4));
        assert_eq!(table.get(2).unwrap(), Some(5));

        let trap = table.init(2, &[9, 9]).unwrap_err();
        assert_eq!(trap.kind, TrapKind::UndefinedElement);
    }

    #[test]
    fn invalid_limits() {
        assert!(Table::new(Limits::new(5, Some(2))).is_err());
    }
}
