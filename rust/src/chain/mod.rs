use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("slot {0} is already on the list")]
    AlreadyLinked(usize),
    #[error("slot {0} is outside the list arena")]
    OutOfRange(usize),
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

// A Chain is a FIFO of slot numbers in which every slot appears at most once.
// Links live in a side table indexed by slot, so extracting an arbitrary
// member is O(1).
#[derive(Debug)]
pub struct Chain {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Chain {
    pub fn with_capacity(slots: usize) -> Chain {
        Chain {
            links: vec![Link::default(); slots],
            head: None,
            tail: None,
            len: 0,
        }
    }

    // Appends at the tail. A slot that is already a member is an error, not a move.
    pub fn append(&mut self, slot: usize) -> Result<(), ChainError> {
        let link = self.links.get(slot).ok_or(ChainError::OutOfRange(slot))?;
        if link.linked {
            return Err(ChainError::AlreadyLinked(slot));
        }
        self.links[slot] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(t) => self.links[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        Ok(())
    }

    // Removes `slot` wherever it is. Returns false if it was not a member.
    pub fn extract(&mut self, slot: usize) -> bool {
        let Some(link) = self.links.get(slot).copied() else {
            return false;
        };
        if !link.linked {
            return false;
        }
        match link.prev {
            Some(p) => self.links[p].next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => self.links[n].prev = link.prev,
            None => self.tail = link.prev,
        }
        self.links[slot] = Link::default();
        self.len -= 1;
        true
    }

    // Removes and returns the oldest member.
    pub fn pop_front(&mut self) -> Option<usize> {
        let head = self.head?;
        self.extract(head);
        Some(head)
    }

    // The oldest member, or None if the list is empty.
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    // The most recently appended member, or None if the list is empty.
    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    // Returns a copy of the members, oldest first.
    pub fn order(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(slot) = cur {
            out.push(slot);
            cur = self.links[slot].next;
        }
        out
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.links.get(slot).is_some_and(|l| l.linked)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
