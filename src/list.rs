use std::{marker::PhantomData, ptr::NonNull};


/// Non-null pointer to `T`. A `None` link at either end of a [`List`] stands for
/// the list anchor (the sentinel), which never lives in heap memory.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Node of an intrusive list. Nodes are never allocated by the list itself,
/// they are written in place inside memory that the allocator already owns
/// (extent headers and block headers).
#[repr(C)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list of [`Node<T>`].
///
/// Conceptually the list is circular: `head` is what the sentinel's `next`
/// would be and `tail` is the sentinel's `prev`. Walking off either end yields
/// `None`, which is how we recognize that the scan went back to the sentinel.
///
/// ```text
///            +------+    +------+    +------+
/// (None) <-- | head | -> | .... | -> | tail | --> (None)
///            +------+    +------+    +------+
/// ```
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

/// Iterator over the nodes of a [`List`]. It yields pointers rather than
/// references because callers usually want to relink or rewrite the node.
///
/// The successor is read before a node is yielded, so the caller may unlink
/// or even unmap the yielded node without breaking the iteration.
pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a new node to the Linked List.
    ///
    /// It is very important for us that, because we are the actual memory
    /// allocator, this method can not make allocations itself. Therefor,
    /// it has to receive the `addr` where this node has to be allocated.
    ///
    /// This way, the node will we placed inside of our data structures in
    /// the exact place we want.
    ///
    /// **SAFETY**: Caller (we, as the allocator) must guarantee that the given `addr` is valid
    /// and suitably aligned for [`Node<T>`].
    pub unsafe fn append(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node {
                next: None,
                prev: None,
                data,
            });

            self.insert_before(node, None);
        }

        node
    }

    /// Links an already written `node` right before `successor`. A `None`
    /// successor means "before the sentinel", in other words at the tail.
    ///
    /// **SAFETY**: `node` must not be linked already and `successor` must be a
    /// member of this list.
    pub unsafe fn insert_before(&mut self, mut node: NonNull<Node<T>>, successor: Link<Node<T>>) {
        unsafe {
            let prev = match successor {
                Some(mut next) => {
                    let prev = next.as_ref().prev;
                    next.as_mut().prev = Some(node);
                    prev
                }
                None => {
                    let prev = self.tail;
                    self.tail = Some(node);
                    prev
                }
            };

            match prev {
                Some(mut prev) => prev.as_mut().next = Some(node),
                None => self.head = Some(node),
            }

            node.as_mut().next = successor;
            node.as_mut().prev = prev;
        }

        self.len += 1;
    }

    /// Unlinks `node`. Its own links are left untouched, they are simply
    /// meaningless from now on.
    ///
    /// **SAFETY**: `node` must be a member of this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            let next = node.as_ref().next;
            let prev = node.as_ref().prev;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }
        }

        self.len -= 1;
    }

    /// Puts `new` in the exact position `old` had. The length does not change.
    ///
    /// **SAFETY**: `old` must be a member of this list and `new` must not be.
    pub unsafe fn replace(&mut self, old: NonNull<Node<T>>, mut new: NonNull<Node<T>>) {
        unsafe {
            let next = old.as_ref().next;
            let prev = old.as_ref().prev;

            new.as_mut().next = next;
            new.as_mut().prev = prev;

            match prev {
                Some(mut prev) => prev.as_mut().next = Some(new),
                None => self.head = Some(new),
            }

            match next {
                Some(mut next) => next.as_mut().prev = Some(new),
                None => self.tail = Some(new),
            }
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;
        }

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
