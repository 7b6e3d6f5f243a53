use super::Iter;
use crate::error::Error;

/// Produces a child iterator from the value of an index entry. Used both
/// inside a table (data-index entry -> data-block iterator) and across a
/// sorted level (file entry -> table iterator).
pub type ChildFn = Box<dyn Fn(&[u8]) -> Box<dyn Iter> + Send>;

/// Flattens a parent iterator whose values describe child iterators into
/// one cursor over all child entries.
pub struct IndexIter {
    index: Box<dyn Iter>,
    child_fn: ChildFn,
    child: Option<Box<dyn Iter>>,
    err: Option<Error>,
}

impl IndexIter {
    pub fn new(index: Box<dyn Iter>, child_fn: ChildFn) -> Self {
        IndexIter { index, child_fn, child: None, err: None }
    }

    fn open_child(&mut self) {
        let child = (self.child_fn)(self.index.value());
        self.child = Some(child);
    }

    /// Captures a child error; errors stop iteration rather than being
    /// skipped like empty children.
    fn child_failed(&mut self) -> bool {
        if let Some(err) = self.child.as_ref().and_then(|c| c.err()) {
            self.err = Some(err);
            self.child = None;
            return true;
        }
        false
    }

    fn skip_empty_forward(&mut self) -> bool {
        loop {
            if self.child_failed() {
                return false;
            }
            if self.child.as_ref().is_some_and(|c| c.valid()) {
                return true;
            }
            if !self.index.next() {
                self.child = None;
                return false;
            }
            self.open_child();
            self.child.as_mut().unwrap().first();
        }
    }

    fn skip_empty_backward(&mut self) -> bool {
        loop {
            if self.child_failed() {
                return false;
            }
            if self.child.as_ref().is_some_and(|c| c.valid()) {
                return true;
            }
            if !self.index.prev() {
                self.child = None;
                return false;
            }
            self.open_child();
            self.child.as_mut().unwrap().last();
        }
    }
}

impl Iter for IndexIter {
    fn valid(&self) -> bool {
        self.child.as_ref().is_some_and(|c| c.valid())
    }

    fn first(&mut self) -> bool {
        if !self.index.first() {
            self.child = None;
            return false;
        }
        self.open_child();
        self.child.as_mut().unwrap().first();
        self.skip_empty_forward()
    }

    fn last(&mut self) -> bool {
        if !self.index.last() {
            self.child = None;
            return false;
        }
        self.open_child();
        self.child.as_mut().unwrap().last();
        self.skip_empty_backward()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        if !self.index.seek(target) {
            self.child = None;
            return false;
        }
        self.open_child();
        self.child.as_mut().unwrap().seek(target);
        self.skip_empty_forward()
    }

    fn next(&mut self) -> bool {
        match &mut self.child {
            None => self.first(),
            Some(child) => {
                child.next();
                self.skip_empty_forward()
            }
        }
    }

    fn prev(&mut self) -> bool {
        match &mut self.child {
            None => self.last(),
            Some(child) => {
                child.prev();
                self.skip_empty_backward()
            }
        }
    }

    fn key(&self) -> &[u8] {
        self.child.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.child.as_ref().expect("value() on invalid iterator").value()
    }

    fn err(&self) -> Option<Error> {
        self.err
            .clone()
            .or_else(|| self.index.err())
            .or_else(|| self.child.as_ref().and_then(|c| c.err()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::VecIter;

    /// Index over three "files", each value naming which child to build.
    fn two_level() -> IndexIter {
        let index = VecIter::new(vec![
            (b"b".to_vec(), b"0".to_vec()),
            (b"d".to_vec(), b"1".to_vec()),
            (b"f".to_vec(), b"2".to_vec()),
        ]);
        let child_fn: ChildFn = Box::new(|value: &[u8]| -> Box<dyn Iter> {
            let entries = match value {
                b"0" => vec![
                    (b"a".to_vec(), b"1".to_vec()),
                    (b"b".to_vec(), b"2".to_vec()),
                ],
                b"1" => vec![],
                _ => vec![
                    (b"e".to_vec(), b"5".to_vec()),
                    (b"f".to_vec(), b"6".to_vec()),
                ],
            };
            Box::new(VecIter::new(entries))
        });
        IndexIter::new(Box::new(index), child_fn)
    }

    fn collect_forward(it: &mut IndexIter) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut ok = it.first();
        while ok {
            out.push(it.key().to_vec());
            ok = it.next();
        }
        out
    }

    #[test]
    fn flattens_and_skips_empty_children() {
        let mut it = two_level();
        assert_eq!(
            collect_forward(&mut it),
            vec![b"a".to_vec(), b"b".to_vec(), b"e".to_vec(), b"f".to_vec()]
        );
    }

    #[test]
    fn backward_skips_empty_children() {
        let mut it = two_level();
        let mut out = Vec::new();
        let mut ok = it.last();
        while ok {
            out.push(it.key().to_vec());
            ok = it.prev();
        }
        out.reverse();
        assert_eq!(
            out,
            vec![b"a".to_vec(), b"b".to_vec(), b"e".to_vec(), b"f".to_vec()]
        );
    }

    #[test]
    fn seek_lands_in_correct_child() {
        let mut it = two_level();
        assert!(it.seek(b"c"));
        // "c" maps past child 0 and child 1 is empty.
        assert_eq!(it.key(), b"e");
        assert!(it.seek(b"b"));
        assert_eq!(it.key(), b"b");
        assert!(!it.seek(b"zzz"));
    }
}
