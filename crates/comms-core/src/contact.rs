use serde::{Deserialize, Serialize};

/// Presence status reported before the backend tells us anything.
pub const UNKNOWN_PRESENCE: &str = "unknown";

/// A remote party known to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    /// Federation-wide identity, e.g. `user@server`.
    pub id: String,
    pub name: String,
    pub presence_status: String,
    pub presence_message: String,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            presence_status: UNKNOWN_PRESENCE.to_owned(),
            presence_message: String::new(),
        }
    }

    pub fn with_presence(mut self, status: impl Into<String>, message: impl Into<String>) -> Self {
        self.presence_status = status.into();
        self.presence_message = message.into();
        self
    }
}

/// Named collection of contacts with nested groups.
///
/// Contact ids are unique across the whole tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactGroup {
    pub name: String,
    contacts: Vec<Contact>,
    subgroups: Vec<ContactGroup>,
}

impl ContactGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contacts: Vec::new(),
            subgroups: Vec::new(),
        }
    }

    /// Contacts directly in this group.
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn subgroups(&self) -> &[ContactGroup] {
        &self.subgroups
    }

    /// Every contact in this group and its subgroups, depth first.
    pub fn all_contacts(&self) -> Vec<&Contact> {
        let mut out: Vec<&Contact> = self.contacts.iter().collect();
        for group in &self.subgroups {
            out.extend(group.all_contacts());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.contacts.len() + self.subgroups.iter().map(ContactGroup::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: &str) -> Option<&Contact> {
        self.contacts
            .iter()
            .find(|contact| contact.id == id)
            .or_else(|| self.subgroups.iter().find_map(|group| group.find(id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Add a contact to this group. Returns `false` if the id already exists
    /// anywhere in the tree.
    pub fn insert(&mut self, contact: Contact) -> bool {
        if self.contains(&contact.id) {
            return false;
        }
        self.contacts.push(contact);
        true
    }

    /// Add a subgroup, dropping contacts whose ids are already present.
    pub fn insert_group(&mut self, mut group: ContactGroup) {
        group.retain_unique(self);
        self.subgroups.push(group);
    }

    /// Remove a contact from wherever it sits in the tree.
    pub fn remove(&mut self, id: &str) -> Option<Contact> {
        if let Some(idx) = self.contacts.iter().position(|contact| contact.id == id) {
            return Some(self.contacts.remove(idx));
        }
        self.subgroups.iter_mut().find_map(|group| group.remove(id))
    }

    /// Apply `update` to the contact with `id`, returning the updated copy.
    pub fn update<F>(&mut self, id: &str, update: F) -> Option<Contact>
    where
        F: FnOnce(&mut Contact),
    {
        let contact = self.find_mut(id)?;
        update(contact);
        Some(contact.clone())
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Contact> {
        if let Some(idx) = self.contacts.iter().position(|contact| contact.id == id) {
            return self.contacts.get_mut(idx);
        }
        self.subgroups
            .iter_mut()
            .find_map(|group| group.find_mut(id))
    }

    fn retain_unique(&mut self, existing: &ContactGroup) {
        let mut seen: Vec<String> = Vec::new();
        self.contacts.retain(|contact| {
            let keep = !existing.contains(&contact.id) && !seen.contains(&contact.id);
            seen.push(contact.id.clone());
            keep
        });
        for group in &mut self.subgroups {
            group.retain_unique(existing);
        }
    }
}
