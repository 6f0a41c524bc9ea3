//! Pure helpers for list-valued fields. Each returns a fresh `Vec`; the
//! input slice is never touched and out-of-range indices are no-ops.

pub fn prepend<T: Clone>(list: &[T], element: T) -> Vec<T> {
    let mut next = Vec::with_capacity(list.len() + 1);
    next.push(element);
    next.extend_from_slice(list);
    next
}

pub fn append<T: Clone>(list: &[T], element: T) -> Vec<T> {
    let mut next = list.to_vec();
    next.push(element);
    next
}

pub fn remove<T: Clone>(list: &[T], index: usize) -> Vec<T> {
    let mut next = list.to_vec();
    if index < next.len() {
        next.remove(index);
    }
    next
}

pub fn replace<T: Clone>(list: &[T], index: usize, element: T) -> Vec<T> {
    let mut next = list.to_vec();
    if index < next.len() {
        next[index] = element;
    }
    next
}

pub fn insert<T: Clone>(list: &[T], index: usize, element: T) -> Vec<T> {
    let mut next = list.to_vec();
    let index = index.min(next.len());
    next.insert(index, element);
    next
}

pub fn swap<T: Clone>(list: &[T], index_a: usize, index_b: usize) -> Vec<T> {
    let mut next = list.to_vec();
    if index_a < next.len() && index_b < next.len() {
        next.swap(index_a, index_b);
    }
    next
}

pub fn move_item<T: Clone>(list: &[T], from: usize, to: usize) -> Vec<T> {
    let mut next = list.to_vec();
    if from < next.len() {
        let element = next.remove(from);
        let to = to.min(next.len());
        next.insert(to, element);
    }
    next
}
